use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::warn;

use fragment_core::ids::{EphemeralId, RoomId, UserId};
use fragment_core::rooms::{EphemeralRoom, OwnershipRecord};
use fragment_store::ownership::OwnershipRepo;
use fragment_store::StoreError;

/// Durable shadow of the ledger. Failures are logged by the ledger and never
/// change the in-memory outcome.
pub trait LedgerMirror: Send + Sync {
    fn record_created(&self, room: &EphemeralRoom, owner: UserId) -> Result<(), StoreError>;
    fn record_owner(&self, ephemeral_id: &EphemeralId, owner: UserId) -> Result<(), StoreError>;
    fn record_removed(&self, ephemeral_id: &EphemeralId) -> Result<(), StoreError>;
}

impl LedgerMirror for OwnershipRepo {
    fn record_created(&self, room: &EphemeralRoom, owner: UserId) -> Result<(), StoreError> {
        self.insert(room, owner)
    }

    fn record_owner(&self, ephemeral_id: &EphemeralId, owner: UserId) -> Result<(), StoreError> {
        self.set_owner(ephemeral_id, owner).map(|_| ())
    }

    fn record_removed(&self, ephemeral_id: &EphemeralId) -> Result<(), StoreError> {
        self.remove(ephemeral_id).map(|_| ())
    }
}

/// Current owner of every live ephemeral room, keyed by ephemeral id.
///
/// Each operation is atomic per key. No method awaits, so callers can use
/// the ledger from any task without holding a guard across provider calls.
#[derive(Default)]
pub struct OwnershipLedger {
    records: DashMap<EphemeralId, OwnershipRecord>,
    mirror: Option<Arc<dyn LedgerMirror>>,
}

impl OwnershipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mirror(mirror: Arc<dyn LedgerMirror>) -> Self {
        Self {
            records: DashMap::new(),
            mirror: Some(mirror),
        }
    }

    /// Record `owner` for a newly active room, replacing any previous entry.
    pub fn put(&self, room: &EphemeralRoom, owner: UserId) -> OwnershipRecord {
        let record = OwnershipRecord {
            ephemeral_id: room.ephemeral_id.clone(),
            room_id: room.room_id,
            guild_id: room.guild_id,
            owner,
            assigned_at: Utc::now(),
        };
        self.records.insert(room.ephemeral_id.clone(), record.clone());
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.record_created(room, owner) {
                warn!(ephemeral_id = %room.ephemeral_id, error = %e, "ledger mirror insert failed");
            }
        }
        record
    }

    /// Hand the room to `new_owner`. Returns the previous owner, or `None`
    /// when the room is not in the ledger (nothing is written then).
    pub fn reassign(&self, ephemeral_id: &EphemeralId, new_owner: UserId) -> Option<UserId> {
        let previous = {
            let mut entry = self.records.get_mut(ephemeral_id)?;
            let previous = entry.owner;
            entry.owner = new_owner;
            entry.assigned_at = Utc::now();
            previous
        };
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.record_owner(ephemeral_id, new_owner) {
                warn!(ephemeral_id = %ephemeral_id, error = %e, "ledger mirror update failed");
            }
        }
        Some(previous)
    }

    pub fn owner_of(&self, ephemeral_id: &EphemeralId) -> Option<UserId> {
        self.records.get(ephemeral_id).map(|r| r.owner)
    }

    /// The room `user` currently owns. A user owns at most one room in
    /// practice; if the ledger ever holds several, the most recently
    /// assigned wins.
    pub fn room_owned_by(&self, user: UserId) -> Option<OwnershipRecord> {
        self.records
            .iter()
            .filter(|r| r.owner == user)
            .max_by_key(|r| r.assigned_at)
            .map(|r| r.value().clone())
    }

    pub fn by_room(&self, room_id: RoomId) -> Option<OwnershipRecord> {
        self.records
            .iter()
            .find(|r| r.room_id == room_id)
            .map(|r| r.value().clone())
    }

    pub fn remove(&self, ephemeral_id: &EphemeralId) -> Option<OwnershipRecord> {
        let removed = self.records.remove(ephemeral_id).map(|(_, r)| r);
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.record_removed(ephemeral_id) {
                warn!(ephemeral_id = %ephemeral_id, error = %e, "ledger mirror delete failed");
            }
        }
        removed
    }

    pub fn get(&self, ephemeral_id: &EphemeralId) -> Option<OwnershipRecord> {
        self.records.get(ephemeral_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, oldest assignment first.
    pub fn snapshot(&self) -> Vec<OwnershipRecord> {
        let mut out: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        out.sort_by_key(|r| r.assigned_at);
        out
    }
}
