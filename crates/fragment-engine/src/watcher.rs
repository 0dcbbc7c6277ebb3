use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fragment_core::events::LifecycleEvent;
use fragment_core::ids::UserId;
use fragment_core::rooms::EphemeralRoom;

use crate::controller::{Reap, RoomSignal, Shared};

/// Occupants in the order this watcher saw them join.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Roster {
    order: Vec<UserId>,
}

impl Roster {
    pub(crate) fn seeded(users: impl IntoIterator<Item = UserId>) -> Self {
        let mut roster = Self::default();
        for user in users {
            roster.joined(user);
        }
        roster
    }

    pub(crate) fn joined(&mut self, user: UserId) {
        if !self.order.contains(&user) {
            self.order.push(user);
        }
    }

    pub(crate) fn left(&mut self, user: UserId) {
        self.order.retain(|u| *u != user);
    }

    /// Drop anyone the provider no longer reports.
    pub(crate) fn retain_present(&mut self, occupants: &[UserId]) {
        self.order.retain(|u| occupants.contains(u));
    }

    /// Next owner among `occupants`: earliest roster member first, then
    /// members the roster never saw by ascending id.
    pub(crate) fn successor(&self, occupants: &[UserId], exclude: Option<UserId>) -> Option<UserId> {
        let eligible = |u: &UserId| Some(*u) != exclude && occupants.contains(u);
        self.order.iter().copied().find(eligible).or_else(|| {
            occupants
                .iter()
                .copied()
                .filter(|u| Some(*u) != exclude && !self.order.contains(u))
                .min()
        })
    }

    #[cfg(test)]
    pub(crate) fn as_slice(&self) -> &[UserId] {
        &self.order
    }
}

/// Per-room task. Owns the room's join order and decides when the room is
/// handed over or reaped.
pub(crate) struct Watcher {
    shared: Arc<Shared>,
    room: EphemeralRoom,
    roster: Roster,
    rx: mpsc::Receiver<RoomSignal>,
}

impl Watcher {
    pub(crate) fn new(
        shared: Arc<Shared>,
        room: EphemeralRoom,
        roster: Roster,
        rx: mpsc::Receiver<RoomSignal>,
    ) -> Self {
        Self {
            shared,
            room,
            roster,
            rx,
        }
    }

    pub(crate) async fn run(mut self) {
        let cancel = self.shared.cancel.clone();
        loop {
            let idle = tokio::time::sleep(self.shared.config.liveness_timeout);
            let flow = tokio::select! {
                _ = cancel.cancelled() => ControlFlow::Break(()),
                signal = self.rx.recv() => match signal {
                    Some(RoomSignal::Joined(user)) => {
                        self.roster.joined(user);
                        ControlFlow::Continue(())
                    }
                    Some(RoomSignal::Left(user)) => {
                        self.roster.left(user);
                        self.reconcile(Some(user), false).await
                    }
                    None => ControlFlow::Break(()),
                },
                _ = idle => {
                    debug!(room_id = %self.room.room_id, "room idle, re-checking occupancy");
                    self.reconcile(None, true).await
                }
            };
            if flow.is_break() {
                break;
            }
        }
    }

    /// Compare the ledger with the provider's live occupant list and act on
    /// the difference.
    async fn reconcile(&mut self, departed: Option<UserId>, liveness: bool) -> ControlFlow<()> {
        let room = &self.room;
        let occupants = match self.shared.provider.occupants(room.guild_id, room.room_id).await {
            Ok(occupants) => occupants,
            Err(e) if e.is_not_found() => {
                warn!(
                    guild_id = %room.guild_id,
                    room_id = %room.room_id,
                    "room disappeared from the platform, purging"
                );
                self.shared.retire(&self.room, Reap::Vanished).await;
                return ControlFlow::Break(());
            }
            Err(e) if liveness => {
                warn!(
                    guild_id = %room.guild_id,
                    room_id = %room.room_id,
                    error = %e,
                    "liveness check unanswered, force reaping"
                );
                self.shared.retire(&self.room, Reap::Forced).await;
                return ControlFlow::Break(());
            }
            Err(e) => {
                warn!(
                    guild_id = %room.guild_id,
                    room_id = %room.room_id,
                    error = %e,
                    "occupancy check failed"
                );
                return ControlFlow::Continue(());
            }
        };

        if occupants.is_empty() {
            if liveness {
                warn!(guild_id = %room.guild_id, room_id = %room.room_id, "idle room is empty, force reaping");
            }
            let reason = if liveness { Reap::Forced } else { Reap::Empty };
            self.shared.retire(&self.room, reason).await;
            return ControlFlow::Break(());
        }

        self.roster.retain_present(&occupants);
        self.hand_over_if_needed(departed, &occupants);
        ControlFlow::Continue(())
    }

    fn hand_over_if_needed(&self, departed: Option<UserId>, occupants: &[UserId]) {
        let room = &self.room;
        let ledger = &self.shared.ledger;
        let Some(owner) = ledger.owner_of(&room.ephemeral_id) else {
            return;
        };
        if Some(owner) != departed && occupants.contains(&owner) {
            return;
        }
        let Some(next) = self.roster.successor(occupants, Some(owner)) else {
            return;
        };
        let Some(previous) = ledger.reassign(&room.ephemeral_id, next) else {
            return;
        };
        info!(
            guild_id = %room.guild_id,
            room_id = %room.room_id,
            ephemeral_id = %room.ephemeral_id,
            previous = %previous,
            owner = %next,
            "ownership transferred"
        );
        self.shared.emit(LifecycleEvent::OwnerChanged {
            guild_id: room.guild_id,
            ephemeral_id: room.ephemeral_id.clone(),
            room_id: room.room_id,
            previous,
            owner: next,
        });
    }
}
