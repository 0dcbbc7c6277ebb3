use serde::{Deserialize, Serialize};

use crate::ids::{EphemeralId, GuildId, RoomId, UserId};

/// A member moved between voice rooms. `from == None` is a connect,
/// `to == None` a disconnect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub user_id: UserId,
    pub guild_id: GuildId,
    #[serde(default)]
    pub from_room_id: Option<RoomId>,
    #[serde(default)]
    pub to_room_id: Option<RoomId>,
}

impl TransitionEvent {
    pub fn join(guild_id: GuildId, user_id: UserId, room: RoomId) -> Self {
        Self {
            user_id,
            guild_id,
            from_room_id: None,
            to_room_id: Some(room),
        }
    }

    pub fn leave(guild_id: GuildId, user_id: UserId, room: RoomId) -> Self {
        Self {
            user_id,
            guild_id,
            from_room_id: Some(room),
            to_room_id: None,
        }
    }

    pub fn moved(guild_id: GuildId, user_id: UserId, from: RoomId, to: RoomId) -> Self {
        Self {
            user_id,
            guild_id,
            from_room_id: Some(from),
            to_room_id: Some(to),
        }
    }

    /// Mute/deafen updates arrive as transitions within the same room.
    pub fn is_noop(&self) -> bool {
        self.from_room_id == self.to_room_id
    }
}

/// Observable lifecycle notifications emitted by the controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    #[serde(rename = "room_created")]
    RoomCreated {
        guild_id: GuildId,
        ephemeral_id: EphemeralId,
        room_id: RoomId,
        parent_room_id: RoomId,
        owner: UserId,
    },

    #[serde(rename = "owner_changed")]
    OwnerChanged {
        guild_id: GuildId,
        ephemeral_id: EphemeralId,
        room_id: RoomId,
        previous: UserId,
        owner: UserId,
    },

    #[serde(rename = "room_reaped")]
    RoomReaped {
        guild_id: GuildId,
        ephemeral_id: EphemeralId,
        room_id: RoomId,
        forced: bool,
    },

    #[serde(rename = "room_adopted")]
    RoomAdopted {
        guild_id: GuildId,
        ephemeral_id: EphemeralId,
        room_id: RoomId,
        owner: UserId,
    },

    #[serde(rename = "creation_failed")]
    CreationFailed {
        guild_id: GuildId,
        parent_room_id: RoomId,
        user_id: UserId,
        error: String,
    },

    #[serde(rename = "stale_event")]
    StaleEvent {
        guild_id: GuildId,
        room_id: RoomId,
        user_id: UserId,
    },
}

impl LifecycleEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::RoomCreated { guild_id, .. }
            | Self::OwnerChanged { guild_id, .. }
            | Self::RoomReaped { guild_id, .. }
            | Self::RoomAdopted { guild_id, .. }
            | Self::CreationFailed { guild_id, .. }
            | Self::StaleEvent { guild_id, .. } => *guild_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RoomCreated { .. } => "room_created",
            Self::OwnerChanged { .. } => "owner_changed",
            Self::RoomReaped { .. } => "room_reaped",
            Self::RoomAdopted { .. } => "room_adopted",
            Self::CreationFailed { .. } => "creation_failed",
            Self::StaleEvent { .. } => "stale_event",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_constructors() {
        let g = GuildId::new(1);
        let u = UserId::new(2);
        let e = TransitionEvent::join(g, u, RoomId::new(3));
        assert_eq!(e.from_room_id, None);
        assert_eq!(e.to_room_id, Some(RoomId::new(3)));
        let e = TransitionEvent::leave(g, u, RoomId::new(3));
        assert_eq!(e.to_room_id, None);
        assert!(!e.is_noop());
        let e = TransitionEvent::moved(g, u, RoomId::new(3), RoomId::new(3));
        assert!(e.is_noop());
    }

    #[test]
    fn transition_wire_format() {
        let e: TransitionEvent = serde_json::from_value(serde_json::json!({
            "userId": "7",
            "guildId": "1",
            "toRoomId": "9"
        }))
        .unwrap();
        assert_eq!(e.from_room_id, None);
        assert_eq!(e.to_room_id, Some(RoomId::new(9)));
    }

    #[test]
    fn lifecycle_event_tagging() {
        let event = LifecycleEvent::RoomReaped {
            guild_id: GuildId::new(1),
            ephemeral_id: EphemeralId::new(),
            room_id: RoomId::new(2),
            forced: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "room_reaped");
        assert_eq!(event.event_type(), "room_reaped");
        assert_eq!(event.guild_id(), GuildId::new(1));
    }
}
