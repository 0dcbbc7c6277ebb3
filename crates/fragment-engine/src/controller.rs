use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fragment_core::errors::ProviderError;
use fragment_core::events::{LifecycleEvent, TransitionEvent};
use fragment_core::ids::{CategoryId, EphemeralId, GuildId, RoomId, UserId};
use fragment_core::provider::{FragmentRegistry, RoomProvider};
use fragment_core::rooms::{EphemeralRoom, RoomState};
use fragment_settings::ControllerSettings;

use crate::error::ControllerError;
use crate::ledger::OwnershipLedger;
use crate::naming;
use crate::watcher::{Roster, Watcher};

/// Tuning for the lifecycle controller.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// How long a reaped room id keeps absorbing stale events.
    pub cooldown: Duration,
    /// Idle period after which a watcher re-checks its room with the provider.
    pub liveness_timeout: Duration,
    /// Capacity of the transition queue and the lifecycle broadcast.
    pub event_buffer: usize,
    /// Capacity of each room's signal queue.
    pub watcher_buffer: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(30 * 60),
            event_buffer: 1024,
            watcher_buffer: 64,
        }
    }
}

impl From<&ControllerSettings> for ControllerConfig {
    fn from(s: &ControllerSettings) -> Self {
        Self {
            cooldown: Duration::from_secs(s.cooldown_secs),
            liveness_timeout: Duration::from_secs(s.liveness_timeout_secs),
            event_buffer: s.event_buffer.max(1),
            watcher_buffer: s.watcher_buffer.max(1),
        }
    }
}

/// Membership change delivered to a room's watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RoomSignal {
    Joined(UserId),
    Left(UserId),
}

/// Why a room is being taken down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reap {
    /// Last occupant left.
    Empty,
    /// Liveness check found the room empty or could not get an answer.
    Forced,
    /// Provider no longer knows the room.
    Vanished,
}

struct RoomRoute {
    room: EphemeralRoom,
    state: RoomState,
    tx: mpsc::Sender<RoomSignal>,
}

struct Retired {
    until: Instant,
    pending_delete: bool,
    room: EphemeralRoom,
}

/// Point-in-time view of one live room.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    #[serde(flatten)]
    pub room: EphemeralRoom,
    pub state: RoomState,
    pub owner: Option<UserId>,
}

pub(crate) struct Shared {
    pub(crate) registry: Arc<dyn FragmentRegistry>,
    pub(crate) provider: Arc<dyn RoomProvider>,
    pub(crate) ledger: Arc<OwnershipLedger>,
    pub(crate) config: ControllerConfig,
    pub(crate) cancel: CancellationToken,
    routes: DashMap<RoomId, RoomRoute>,
    retired: DashMap<RoomId, Retired>,
    event_tx: broadcast::Sender<LifecycleEvent>,
}

/// Cloneable sender side of the controller's transition queue.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<TransitionEvent>,
}

impl ControllerHandle {
    /// Queue a transition, waiting for space if the queue is full.
    pub async fn submit(&self, event: TransitionEvent) -> Result<(), ControllerError> {
        self.tx.send(event).await.map_err(|_| ControllerError::Closed)
    }

    /// Queue a transition without waiting.
    pub fn try_submit(&self, event: TransitionEvent) -> Result<(), ControllerError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ControllerError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => ControllerError::Closed,
        })
    }

    pub fn sender(&self) -> mpsc::Sender<TransitionEvent> {
        self.tx.clone()
    }
}

/// Drives every ephemeral room through creation, ownership hand-off and
/// reaping. Transitions are consumed in arrival order by one dispatch loop;
/// each live room is watched by its own task.
#[derive(Clone)]
pub struct LifecycleController {
    shared: Arc<Shared>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<dyn FragmentRegistry>,
        provider: Arc<dyn RoomProvider>,
        ledger: Arc<OwnershipLedger>,
        config: ControllerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                registry,
                provider,
                ledger,
                config,
                cancel: CancellationToken::new(),
                routes: DashMap::new(),
                retired: DashMap::new(),
                event_tx,
            }),
        }
    }

    /// Spawn the dispatch loop. Returns the queue handle and the loop's task.
    pub fn start(&self) -> (ControllerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.shared.config.event_buffer.max(1));
        let join = tokio::spawn(self.clone().run(rx));
        (ControllerHandle { tx }, join)
    }

    /// Consume transitions until the queue closes or the controller is shut down.
    pub async fn run(self, mut rx: mpsc::Receiver<TransitionEvent>) {
        let period = self.shared.config.cooldown.max(Duration::from_millis(100));
        let mut sweep = tokio::time::interval(period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
                _ = sweep.tick() => self.shared.sweep_retired(),
            }
        }
        debug!(live_rooms = self.shared.routes.len(), "dispatch loop stopped");
    }

    /// Stop dispatch and every watcher. Live rooms are left in place.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn ledger(&self) -> &Arc<OwnershipLedger> {
        &self.shared.ledger
    }

    pub fn provider(&self) -> &Arc<dyn RoomProvider> {
        &self.shared.provider
    }

    pub fn registry(&self) -> &Arc<dyn FragmentRegistry> {
        &self.shared.registry
    }

    /// Whether `room_id` is a live ephemeral room.
    pub fn is_tracked(&self, room_id: RoomId) -> bool {
        self.shared.routes.contains_key(&room_id)
    }

    pub fn state_of(&self, room_id: RoomId) -> Option<RoomState> {
        if let Some(route) = self.shared.routes.get(&room_id) {
            return Some(route.state);
        }
        let retired = self.shared.retired.get(&room_id)?;
        if retired.pending_delete {
            Some(RoomState::Reaping)
        } else if retired.until > Instant::now() {
            Some(RoomState::Gone)
        } else {
            None
        }
    }

    /// Live rooms, oldest first.
    pub fn rooms(&self) -> Vec<RoomSnapshot> {
        let mut out: Vec<RoomSnapshot> = self
            .shared
            .routes
            .iter()
            .map(|r| RoomSnapshot {
                room: r.room.clone(),
                state: r.state,
                owner: self.shared.ledger.owner_of(&r.room.ephemeral_id),
            })
            .collect();
        out.sort_by_key(|s| s.room.created_at);
        out
    }

    /// Apply one transition. A move is a departure from `from` followed by
    /// an arrival in `to`.
    pub async fn dispatch(&self, event: TransitionEvent) {
        if event.is_noop() {
            return;
        }
        let (guild_id, user_id) = (event.guild_id, event.user_id);
        if let Some(from) = event.from_room_id {
            self.deliver(guild_id, user_id, from, RoomSignal::Left(user_id)).await;
        }
        if let Some(to) = event.to_room_id {
            if !self.deliver(guild_id, user_id, to, RoomSignal::Joined(user_id)).await {
                self.maybe_create(guild_id, user_id, to).await;
            }
        }
    }

    /// Hand a signal to the room's watcher. Returns false when the room is
    /// neither live nor cooling down.
    async fn deliver(&self, guild_id: GuildId, user_id: UserId, room_id: RoomId, signal: RoomSignal) -> bool {
        let tx = self.shared.routes.get(&room_id).map(|r| r.tx.clone());
        if let Some(tx) = tx {
            if tx.send(signal).await.is_err() {
                debug!(room_id = %room_id, "watcher already stopped");
            }
            return true;
        }
        self.shared.on_retired(guild_id, user_id, room_id)
    }

    async fn maybe_create(&self, guild_id: GuildId, user_id: UserId, room_id: RoomId) {
        let category_id = match self.shared.registry.is_fragment_parent(room_id).await {
            Ok(Some(category_id)) => category_id,
            Ok(None) => return,
            Err(e) => {
                warn!(guild_id = %guild_id, room_id = %room_id, error = %e, "registry lookup failed");
                return;
            }
        };
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.create_fragment(guild_id, user_id, room_id, category_id).await;
        });
    }

    /// Take over a room that already exists on the platform, e.g. one left
    /// behind by a previous run.
    pub fn adopt(&self, room: EphemeralRoom, owner: UserId, occupants: &[UserId]) {
        Arc::clone(&self.shared).adopt(room, owner, occupants);
    }
}

impl Shared {
    pub(crate) fn emit(&self, event: LifecycleEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn create_fragment(
        self: Arc<Self>,
        guild_id: GuildId,
        user_id: UserId,
        parent_id: RoomId,
        category_id: CategoryId,
    ) {
        match self.provider.afk_room(guild_id).await {
            Ok(Some(afk)) if afk == parent_id => {
                debug!(guild_id = %guild_id, room_id = %parent_id, "afk room is never fragmented");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(guild_id = %guild_id, error = %e, "afk room lookup failed, assuming none");
            }
        }

        let parent = match self.provider.room_info(guild_id, parent_id).await {
            Ok(parent) => parent,
            Err(e) => return self.creation_failed(guild_id, parent_id, user_id, &e),
        };

        let ephemeral_id = EphemeralId::new();
        let name = naming::fragment_name(&parent.name, &ephemeral_id);
        let room_id = match self.provider.create_room(guild_id, &name, category_id).await {
            Ok(room_id) => room_id,
            Err(e) => return self.creation_failed(guild_id, parent_id, user_id, &e),
        };

        let room = EphemeralRoom {
            ephemeral_id,
            room_id,
            parent_room_id: parent_id,
            category_id,
            guild_id,
            created_at: Utc::now(),
        };
        // Route first so the transition caused by the move lands in the
        // watcher's queue.
        let (tx, rx) = mpsc::channel(self.config.watcher_buffer);
        self.routes.insert(
            room_id,
            RoomRoute {
                room: room.clone(),
                state: RoomState::Creating,
                tx,
            },
        );

        if let Err(e) = self.provider.move_member(guild_id, user_id, room_id).await {
            self.routes.remove(&room_id);
            match self.provider.delete_room(guild_id, room_id).await {
                Ok(()) => {}
                Err(del) if del.is_not_found() => {}
                Err(del) => {
                    warn!(guild_id = %guild_id, room_id = %room_id, error = %del, "could not remove unused room");
                }
            }
            return self.creation_failed(guild_id, parent_id, user_id, &e);
        }

        self.ledger.put(&room, user_id);
        if let Some(mut route) = self.routes.get_mut(&room_id) {
            route.state = RoomState::Active;
        }
        info!(
            guild_id = %guild_id,
            room_id = %room_id,
            parent_room_id = %parent_id,
            ephemeral_id = %room.ephemeral_id,
            user_id = %user_id,
            "fragment created"
        );
        self.emit(LifecycleEvent::RoomCreated {
            guild_id,
            ephemeral_id: room.ephemeral_id.clone(),
            room_id,
            parent_room_id: parent_id,
            owner: user_id,
        });

        Watcher::new(Arc::clone(&self), room, Roster::seeded([user_id]), rx)
            .run()
            .await;
    }

    fn creation_failed(&self, guild_id: GuildId, parent_id: RoomId, user_id: UserId, error: &ProviderError) {
        warn!(
            guild_id = %guild_id,
            room_id = %parent_id,
            user_id = %user_id,
            error = %error,
            "fragment creation failed"
        );
        self.emit(LifecycleEvent::CreationFailed {
            guild_id,
            parent_room_id: parent_id,
            user_id,
            error: error.to_string(),
        });
    }

    fn adopt(self: Arc<Self>, room: EphemeralRoom, owner: UserId, occupants: &[UserId]) {
        let (tx, rx) = mpsc::channel(self.config.watcher_buffer);
        self.routes.insert(
            room.room_id,
            RoomRoute {
                room: room.clone(),
                state: RoomState::Active,
                tx,
            },
        );
        self.ledger.put(&room, owner);
        info!(
            guild_id = %room.guild_id,
            room_id = %room.room_id,
            ephemeral_id = %room.ephemeral_id,
            owner = %owner,
            "fragment adopted"
        );
        self.emit(LifecycleEvent::RoomAdopted {
            guild_id: room.guild_id,
            ephemeral_id: room.ephemeral_id.clone(),
            room_id: room.room_id,
            owner,
        });

        let mut others: Vec<UserId> = occupants.iter().copied().filter(|u| *u != owner).collect();
        others.sort();
        let roster = Roster::seeded(std::iter::once(owner).chain(others));
        tokio::spawn(Watcher::new(Arc::clone(&self), room, roster, rx).run());
    }

    /// Take a room out of service: stop routing, drop its ledger entry,
    /// delete it and keep its id retired for the cool-down.
    pub(crate) async fn retire(&self, room: &EphemeralRoom, reason: Reap) {
        self.routes.remove(&room.room_id);
        self.ledger.remove(&room.ephemeral_id);
        self.retired.insert(
            room.room_id,
            Retired {
                until: Instant::now() + self.config.cooldown,
                pending_delete: false,
                room: room.clone(),
            },
        );

        if reason != Reap::Vanished && !self.delete(room).await {
            if let Some(mut retired) = self.retired.get_mut(&room.room_id) {
                retired.pending_delete = true;
            }
        }

        info!(
            guild_id = %room.guild_id,
            room_id = %room.room_id,
            ephemeral_id = %room.ephemeral_id,
            reason = ?reason,
            "fragment reaped"
        );
        self.emit(LifecycleEvent::RoomReaped {
            guild_id: room.guild_id,
            ephemeral_id: room.ephemeral_id.clone(),
            room_id: room.room_id,
            forced: reason == Reap::Forced,
        });
    }

    /// Delete on the platform. An already missing room counts as deleted.
    async fn delete(&self, room: &EphemeralRoom) -> bool {
        match self.provider.delete_room(room.guild_id, room.room_id).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                warn!(
                    guild_id = %room.guild_id,
                    room_id = %room.room_id,
                    error = %e,
                    "room deletion failed, will retry"
                );
                false
            }
        }
    }

    /// Handle an event for a room that may be retired. Returns false when the
    /// room is unknown or its cool-down is over.
    fn on_retired(self: &Arc<Self>, guild_id: GuildId, user_id: UserId, room_id: RoomId) -> bool {
        let retry = {
            let Some(mut retired) = self.retired.get_mut(&room_id) else {
                return false;
            };
            if !retired.pending_delete && retired.until <= Instant::now() {
                drop(retired);
                self.retired.remove(&room_id);
                return false;
            }
            if retired.pending_delete {
                retired.pending_delete = false;
                Some(retired.room.clone())
            } else {
                None
            }
        };

        debug!(guild_id = %guild_id, room_id = %room_id, user_id = %user_id, "stale event discarded");
        self.emit(LifecycleEvent::StaleEvent {
            guild_id,
            room_id,
            user_id,
        });

        if let Some(room) = retry {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                let deleted = shared.delete(&room).await;
                if let Some(mut retired) = shared.retired.get_mut(&room.room_id) {
                    retired.pending_delete = !deleted;
                    if deleted {
                        retired.until = Instant::now() + shared.config.cooldown;
                    }
                }
            });
        }
        true
    }

    fn sweep_retired(&self) {
        let now = Instant::now();
        self.retired
            .retain(|_, retired| retired.pending_delete || retired.until > now);
    }
}
