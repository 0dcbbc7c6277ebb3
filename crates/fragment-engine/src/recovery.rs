use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use fragment_core::ids::{CategoryId, EphemeralId, GuildId, UserId};
use fragment_core::rooms::{EphemeralRoom, RoomInfo};
use fragment_store::ownership::{OwnershipRepo, StoredFragment};

use crate::controller::LifecycleController;
use crate::naming;

/// Outcome of a startup sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub adopted: usize,
    pub reaped: usize,
    pub failed: usize,
}

/// Find fragments a previous run left on the platform. Empty ones are
/// deleted; occupied ones are adopted so they are watched and reaped like
/// any other room.
///
/// `history` is the ledger's durable mirror; when it remembers a room, its
/// parent and owner are restored from there.
pub async fn recover_orphans(
    controller: &LifecycleController,
    history: Option<&OwnershipRepo>,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let guilds = match controller.registry().parent_guilds().await {
        Ok(guilds) => guilds,
        Err(e) => {
            warn!(error = %e, "cannot list guilds for recovery");
            return report;
        }
    };

    for guild_id in guilds {
        let rooms = match controller.provider().list_rooms(guild_id).await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!(guild_id = %guild_id, error = %e, "cannot list rooms for recovery");
                report.failed += 1;
                continue;
            }
        };
        for info in rooms {
            recover_room(controller, history, guild_id, info, &mut report).await;
        }
    }

    info!(
        adopted = report.adopted,
        reaped = report.reaped,
        failed = report.failed,
        "orphan recovery finished"
    );
    report
}

async fn recover_room(
    controller: &LifecycleController,
    history: Option<&OwnershipRepo>,
    guild_id: GuildId,
    info: RoomInfo,
    report: &mut RecoveryReport,
) {
    let Some(ephemeral_id) = naming::parse_fragment_name(&info.name) else {
        return;
    };
    if controller.is_tracked(info.id) {
        return;
    }
    let provider = controller.provider();

    let stored = history.and_then(|h| match h.get_by_room(info.id) {
        Ok(stored) => stored,
        Err(e) => {
            warn!(room_id = %info.id, error = %e, "ownership history unreadable");
            None
        }
    });

    let occupants = match provider.occupants(guild_id, info.id).await {
        Ok(occupants) => occupants,
        Err(e) if e.is_not_found() => return,
        Err(e) => {
            warn!(guild_id = %guild_id, room_id = %info.id, error = %e, "cannot inspect orphan");
            report.failed += 1;
            return;
        }
    };

    if occupants.is_empty() {
        match provider.delete_room(guild_id, info.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(guild_id = %guild_id, room_id = %info.id, error = %e, "cannot delete orphan");
                report.failed += 1;
                return;
            }
        }
        if let Some(h) = history {
            if let Err(e) = h.remove(&ephemeral_id) {
                warn!(room_id = %info.id, error = %e, "ownership history cleanup failed");
            }
        }
        info!(guild_id = %guild_id, room_id = %info.id, "empty orphan deleted");
        report.reaped += 1;
        return;
    }

    let (room, owner) = restore(stored, &info, ephemeral_id, &occupants);
    controller.adopt(room, owner, &occupants);
    report.adopted += 1;
}

/// Rebuild the room record and pick its owner. A remembered owner keeps the
/// room only while still inside it; otherwise the lowest id present wins.
fn restore(
    stored: Option<StoredFragment>,
    info: &RoomInfo,
    ephemeral_id: EphemeralId,
    occupants: &[UserId],
) -> (EphemeralRoom, UserId) {
    let fallback_owner = occupants.iter().copied().min();
    match stored {
        Some(stored) if stored.room.ephemeral_id == ephemeral_id => {
            let owner = if occupants.contains(&stored.owner) {
                Some(stored.owner)
            } else {
                fallback_owner
            };
            (stored.room, owner.unwrap_or(stored.owner))
        }
        _ => {
            // Parent unknown: the room stands in for its own parent.
            let room = EphemeralRoom {
                ephemeral_id,
                room_id: info.id,
                parent_room_id: info.id,
                category_id: info.category_id.unwrap_or(CategoryId::new(0)),
                guild_id: info.guild_id,
                created_at: Utc::now(),
            };
            let owner = fallback_owner.unwrap_or(UserId::new(0));
            (room, owner)
        }
    }
}
