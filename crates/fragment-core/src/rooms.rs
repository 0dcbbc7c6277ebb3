use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CategoryId, EphemeralId, GuildId, RoomId, UserId};

/// A voice room as the platform describes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: RoomId,
    pub guild_id: GuildId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<CategoryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_limit: Option<u32>,
}

/// Attribute changes an owner may request on their room.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomEdit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `Some(0)` removes the limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_limit: Option<u32>,
}

impl RoomEdit {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            user_limit: None,
        }
    }

    pub fn resize(limit: u32) -> Self {
        Self {
            name: None,
            user_limit: Some(limit),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.user_limit.is_none()
    }
}

/// An administrator-registered room whose joiners get their own room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRoomConfig {
    pub room_id: RoomId,
    pub category_id: CategoryId,
    pub guild_id: GuildId,
    pub name: String,
}

/// Lifecycle position of an ephemeral room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Creating,
    Active,
    Reaping,
    Gone,
}

impl std::fmt::Display for RoomState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Active => write!(f, "active"),
            Self::Reaping => write!(f, "reaping"),
            Self::Gone => write!(f, "gone"),
        }
    }
}

/// A room spawned for one join, alive until its last occupant leaves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralRoom {
    pub ephemeral_id: EphemeralId,
    pub room_id: RoomId,
    pub parent_room_id: RoomId,
    pub category_id: CategoryId,
    pub guild_id: GuildId,
    pub created_at: DateTime<Utc>,
}

/// Who currently controls an ephemeral room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipRecord {
    pub ephemeral_id: EphemeralId,
    pub room_id: RoomId,
    pub guild_id: GuildId,
    pub owner: UserId,
    pub assigned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_edit_constructors() {
        assert_eq!(RoomEdit::rename("x").name.as_deref(), Some("x"));
        assert_eq!(RoomEdit::resize(4).user_limit, Some(4));
        assert!(RoomEdit::default().is_empty());
        assert!(!RoomEdit::resize(0).is_empty());
    }

    #[test]
    fn room_info_wire_format() {
        let info: RoomInfo = serde_json::from_value(serde_json::json!({
            "id": "10",
            "guildId": 1,
            "name": "Lounge",
            "categoryId": "5"
        }))
        .unwrap();
        assert_eq!(info.id, RoomId::new(10));
        assert_eq!(info.category_id, Some(CategoryId::new(5)));
        assert_eq!(info.user_limit, None);
    }

    #[test]
    fn room_state_display() {
        assert_eq!(RoomState::Creating.to_string(), "creating");
        assert_eq!(RoomState::Gone.to_string(), "gone");
    }
}
