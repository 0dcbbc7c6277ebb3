use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use fragment_core::ids::{EphemeralId, GuildId, RoomId, UserId};
use fragment_core::rooms::EphemeralRoom;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A live ephemeral room as a previous run of the daemon left it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFragment {
    pub room: EphemeralRoom,
    pub owner: UserId,
    pub assigned_at: String,
}

/// Durable copy of the ownership ledger. The in-memory ledger is
/// authoritative; this table only lets a restarted daemon re-adopt rooms
/// with their previous owner and parent.
#[derive(Clone)]
pub struct OwnershipRepo {
    db: Database,
}

impl OwnershipRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, room), fields(ephemeral_id = %room.ephemeral_id, room_id = %room.room_id))]
    pub fn insert(&self, room: &EphemeralRoom, owner: UserId) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ownership (ephemeral_id, room_id, guild_id, parent_room_id, category_id,
                                        owner_id, created_at, assigned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(ephemeral_id) DO UPDATE SET
                    owner_id = excluded.owner_id,
                    assigned_at = excluded.assigned_at",
                rusqlite::params![
                    room.ephemeral_id.as_str(),
                    room.room_id.to_string(),
                    room.guild_id.to_string(),
                    room.parent_room_id.to_string(),
                    room.category_id.to_string(),
                    owner.to_string(),
                    room.created_at.to_rfc3339(),
                    now,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(ephemeral_id = %ephemeral_id, owner = %owner))]
    pub fn set_owner(&self, ephemeral_id: &EphemeralId, owner: UserId) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE ownership SET owner_id = ?1, assigned_at = ?2 WHERE ephemeral_id = ?3",
                rusqlite::params![owner.to_string(), now, ephemeral_id.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    #[instrument(skip(self), fields(ephemeral_id = %ephemeral_id))]
    pub fn remove(&self, ephemeral_id: &EphemeralId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM ownership WHERE ephemeral_id = ?1",
                [ephemeral_id.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_by_room(&self, room_id: RoomId) -> Result<Option<StoredFragment>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT} WHERE room_id = ?1"))?;
            let mut rows = stmt.query([room_id.to_string()])?;
            rows.next()?.map(row_to_fragment).transpose()
        })
    }

    pub fn list(&self, guild_id: GuildId) -> Result<Vec<StoredFragment>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT} WHERE guild_id = ?1 ORDER BY created_at"))?;
            let mut rows = stmt.query([guild_id.to_string()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_fragment(row)?);
            }
            Ok(out)
        })
    }
}

const SELECT: &str = "SELECT ephemeral_id, room_id, guild_id, parent_room_id, category_id,
                             owner_id, created_at, assigned_at
                      FROM ownership";

fn row_to_fragment(row: &rusqlite::Row<'_>) -> Result<StoredFragment, StoreError> {
    const T: &str = "ownership";
    let raw_id: String = row_helpers::get(row, 0, T, "ephemeral_id")?;
    Ok(StoredFragment {
        room: EphemeralRoom {
            ephemeral_id: EphemeralId::from_raw(raw_id),
            room_id: row_helpers::get_parsed(row, 1, T, "room_id")?,
            guild_id: row_helpers::get_parsed(row, 2, T, "guild_id")?,
            parent_room_id: row_helpers::get_parsed(row, 3, T, "parent_room_id")?,
            category_id: row_helpers::get_parsed(row, 4, T, "category_id")?,
            created_at: row_helpers::get_timestamp(row, 6, T, "created_at")?,
        },
        owner: row_helpers::get_parsed(row, 5, T, "owner_id")?,
        assigned_at: row_helpers::get(row, 7, T, "assigned_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fragment_core::ids::CategoryId;

    fn room(room: u64) -> EphemeralRoom {
        EphemeralRoom {
            ephemeral_id: EphemeralId::new(),
            room_id: RoomId::new(room),
            parent_room_id: RoomId::new(10),
            category_id: CategoryId::new(3),
            guild_id: GuildId::new(1),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn insert_then_set_owner() {
        let repo = OwnershipRepo::new(Database::in_memory().unwrap());
        let r = room(100);
        repo.insert(&r, UserId::new(7)).unwrap();
        let stored = repo.get_by_room(RoomId::new(100)).unwrap().unwrap();
        assert_eq!(stored.owner, UserId::new(7));
        assert_eq!(stored.room.parent_room_id, RoomId::new(10));
        assert_eq!(stored.room.ephemeral_id, r.ephemeral_id);

        assert!(repo.set_owner(&r.ephemeral_id, UserId::new(8)).unwrap());
        let stored = repo.get_by_room(RoomId::new(100)).unwrap().unwrap();
        assert_eq!(stored.owner, UserId::new(8));
        assert_eq!(repo.list(GuildId::new(1)).unwrap().len(), 1);
    }

    #[test]
    fn set_owner_on_missing_row() {
        let repo = OwnershipRepo::new(Database::in_memory().unwrap());
        assert!(!repo.set_owner(&EphemeralId::new(), UserId::new(1)).unwrap());
    }

    #[test]
    fn remove_is_idempotent() {
        let repo = OwnershipRepo::new(Database::in_memory().unwrap());
        let r = room(100);
        repo.insert(&r, UserId::new(7)).unwrap();
        assert!(repo.remove(&r.ephemeral_id).unwrap());
        assert!(!repo.remove(&r.ephemeral_id).unwrap());
        assert!(repo.get_by_room(RoomId::new(100)).unwrap().is_none());
    }
}
