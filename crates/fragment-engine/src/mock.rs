use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use fragment_core::errors::ProviderError;
use fragment_core::events::TransitionEvent;
use fragment_core::ids::{CategoryId, GuildId, RoomId, UserId};
use fragment_core::provider::RoomProvider;
use fragment_core::rooms::{RoomEdit, RoomInfo};

/// Provider calls that can be counted and made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    CreateRoom,
    MoveMember,
    DeleteRoom,
    Occupants,
    RoomInfo,
    AfkRoom,
    EditRoom,
    ListRooms,
}

#[derive(Default)]
struct MemoryState {
    rooms: BTreeMap<RoomId, RoomInfo>,
    voice: HashMap<(GuildId, UserId), RoomId>,
    afk: HashMap<GuildId, RoomId>,
    next_id: u64,
    failures: HashMap<ProviderOp, VecDeque<ProviderError>>,
    calls: HashMap<ProviderOp, usize>,
}

/// In-process voice platform. Moves and deletions performed through the
/// [`RoomProvider`] API are reported on the attached event feed exactly as a
/// real platform would report them, so a controller wired to the feed sees
/// the consequences of its own actions.
pub struct MemoryProvider {
    state: Mutex<MemoryState>,
    feed: Mutex<Option<mpsc::Sender<TransitionEvent>>>,
    latency: Mutex<Option<Duration>>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_id: 1_000_000,
                ..Default::default()
            }),
            feed: Mutex::new(None),
            latency: Mutex::new(None),
        }
    }

    /// Route transition events into `tx` (usually a controller's queue).
    pub fn attach(&self, tx: mpsc::Sender<TransitionEvent>) {
        *self.feed.lock() = Some(tx);
    }

    /// Delay every provider call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn add_room(&self, guild_id: GuildId, name: &str, category_id: Option<CategoryId>) -> RoomId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = RoomId::new(state.next_id);
        state.rooms.insert(
            id,
            RoomInfo {
                id,
                guild_id,
                name: name.to_string(),
                category_id,
                user_limit: None,
            },
        );
        id
    }

    pub fn set_afk(&self, guild_id: GuildId, room_id: RoomId) {
        self.state.lock().afk.insert(guild_id, room_id);
    }

    /// Queue `error` as the result of the next call to `op`.
    pub fn fail_next(&self, op: ProviderOp, error: ProviderError) {
        self.state.lock().failures.entry(op).or_default().push_back(error);
    }

    pub fn calls(&self, op: ProviderOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn room(&self, room_id: RoomId) -> Option<RoomInfo> {
        self.state.lock().rooms.get(&room_id).cloned()
    }

    pub fn rooms(&self, guild_id: GuildId) -> Vec<RoomInfo> {
        self.state
            .lock()
            .rooms
            .values()
            .filter(|r| r.guild_id == guild_id)
            .cloned()
            .collect()
    }

    pub fn location(&self, guild_id: GuildId, user_id: UserId) -> Option<RoomId> {
        self.state.lock().voice.get(&(guild_id, user_id)).copied()
    }

    pub fn members(&self, room_id: RoomId) -> Vec<UserId> {
        let state = self.state.lock();
        let mut out: Vec<_> = state
            .voice
            .iter()
            .filter(|(_, r)| **r == room_id)
            .map(|((_, u), _)| *u)
            .collect();
        out.sort();
        out
    }

    /// Put a member in a room without reporting it, as if they were already
    /// there before anyone was listening.
    pub fn place(&self, guild_id: GuildId, user_id: UserId, room_id: RoomId) {
        self.state.lock().voice.insert((guild_id, user_id), room_id);
    }

    /// The member joins `room_id`, or switches to it if already connected.
    pub async fn connect(&self, guild_id: GuildId, user_id: UserId, room_id: RoomId) {
        let from = self.state.lock().voice.insert((guild_id, user_id), room_id);
        let event = match from {
            Some(from) => TransitionEvent::moved(guild_id, user_id, from, room_id),
            None => TransitionEvent::join(guild_id, user_id, room_id),
        };
        self.emit(event).await;
    }

    /// The member leaves voice entirely.
    pub async fn disconnect(&self, guild_id: GuildId, user_id: UserId) {
        let from = self.state.lock().voice.remove(&(guild_id, user_id));
        if let Some(from) = from {
            self.emit(TransitionEvent::leave(guild_id, user_id, from)).await;
        }
    }

    async fn emit(&self, event: TransitionEvent) {
        let tx = self.feed.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    async fn begin(&self, op: ProviderOp) -> Result<(), ProviderError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn missing(room_id: RoomId) -> ProviderError {
    ProviderError::NotFound(format!("room {room_id}"))
}

#[async_trait]
impl RoomProvider for MemoryProvider {
    async fn create_room(
        &self,
        guild_id: GuildId,
        name: &str,
        category_id: CategoryId,
    ) -> Result<RoomId, ProviderError> {
        self.begin(ProviderOp::CreateRoom).await?;
        Ok(self.add_room(guild_id, name, Some(category_id)))
    }

    async fn move_member(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<(), ProviderError> {
        self.begin(ProviderOp::MoveMember).await?;
        let from = {
            let mut state = self.state.lock();
            match state.rooms.get(&room_id) {
                Some(room) if room.guild_id == guild_id => {}
                _ => return Err(missing(room_id)),
            }
            let Some(from) = state.voice.get(&(guild_id, user_id)).copied() else {
                return Err(ProviderError::Rejected(format!(
                    "member {user_id} is not connected to voice"
                )));
            };
            state.voice.insert((guild_id, user_id), room_id);
            from
        };
        if from != room_id {
            self.emit(TransitionEvent::moved(guild_id, user_id, from, room_id))
                .await;
        }
        Ok(())
    }

    async fn delete_room(&self, guild_id: GuildId, room_id: RoomId) -> Result<(), ProviderError> {
        self.begin(ProviderOp::DeleteRoom).await?;
        let evicted: Vec<UserId> = {
            let mut state = self.state.lock();
            if state.rooms.remove(&room_id).is_none() {
                return Err(missing(room_id));
            }
            let evicted: Vec<UserId> = state
                .voice
                .iter()
                .filter(|((g, _), r)| *g == guild_id && **r == room_id)
                .map(|((_, u), _)| *u)
                .collect();
            for user in &evicted {
                state.voice.remove(&(guild_id, *user));
            }
            evicted
        };
        for user in evicted {
            self.emit(TransitionEvent::leave(guild_id, user, room_id)).await;
        }
        Ok(())
    }

    async fn occupants(&self, _guild_id: GuildId, room_id: RoomId) -> Result<Vec<UserId>, ProviderError> {
        self.begin(ProviderOp::Occupants).await?;
        let exists = self.state.lock().rooms.contains_key(&room_id);
        if exists {
            Ok(self.members(room_id))
        } else {
            Err(missing(room_id))
        }
    }

    async fn room_info(&self, _guild_id: GuildId, room_id: RoomId) -> Result<RoomInfo, ProviderError> {
        self.begin(ProviderOp::RoomInfo).await?;
        self.room(room_id).ok_or_else(|| missing(room_id))
    }

    async fn afk_room(&self, guild_id: GuildId) -> Result<Option<RoomId>, ProviderError> {
        self.begin(ProviderOp::AfkRoom).await?;
        Ok(self.state.lock().afk.get(&guild_id).copied())
    }

    async fn edit_room(
        &self,
        _guild_id: GuildId,
        room_id: RoomId,
        edit: &RoomEdit,
    ) -> Result<(), ProviderError> {
        self.begin(ProviderOp::EditRoom).await?;
        let mut state = self.state.lock();
        let room = state.rooms.get_mut(&room_id).ok_or_else(|| missing(room_id))?;
        if let Some(name) = &edit.name {
            room.name = name.clone();
        }
        if let Some(limit) = edit.user_limit {
            room.user_limit = (limit > 0).then_some(limit);
        }
        Ok(())
    }

    async fn list_rooms(&self, guild_id: GuildId) -> Result<Vec<RoomInfo>, ProviderError> {
        self.begin(ProviderOp::ListRooms).await?;
        Ok(self.rooms(guild_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn g() -> GuildId {
        GuildId::new(1)
    }

    #[tokio::test]
    async fn connect_reports_join_then_move() {
        let provider = MemoryProvider::new();
        let (tx, mut rx) = mpsc::channel(8);
        provider.attach(tx);
        let a = provider.add_room(g(), "A", None);
        let b = provider.add_room(g(), "B", None);
        let u = UserId::new(7);

        provider.connect(g(), u, a).await;
        provider.connect(g(), u, b).await;
        provider.disconnect(g(), u).await;

        assert_eq!(rx.recv().await.unwrap(), TransitionEvent::join(g(), u, a));
        assert_eq!(rx.recv().await.unwrap(), TransitionEvent::moved(g(), u, a, b));
        assert_eq!(rx.recv().await.unwrap(), TransitionEvent::leave(g(), u, b));
    }

    #[tokio::test]
    async fn move_requires_voice_connection() {
        let provider = MemoryProvider::new();
        let a = provider.add_room(g(), "A", None);
        let err = provider.move_member(g(), UserId::new(7), a).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected(_)));
    }

    #[tokio::test]
    async fn delete_evicts_members_and_is_not_found_after() {
        let provider = MemoryProvider::new();
        let a = provider.add_room(g(), "A", None);
        provider.place(g(), UserId::new(7), a);

        provider.delete_room(g(), a).await.unwrap();
        assert_eq!(provider.location(g(), UserId::new(7)), None);
        assert!(provider.delete_room(g(), a).await.unwrap_err().is_not_found());
        assert_eq!(provider.calls(ProviderOp::DeleteRoom), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let provider = MemoryProvider::new();
        provider.fail_next(ProviderOp::CreateRoom, ProviderError::Forbidden("nope".into()));
        assert!(provider
            .create_room(g(), "x", CategoryId::new(1))
            .await
            .is_err());
        assert!(provider
            .create_room(g(), "x", CategoryId::new(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn edit_room_updates_name_and_limit() {
        let provider = MemoryProvider::new();
        let a = provider.add_room(g(), "A", None);
        provider.edit_room(g(), a, &RoomEdit::rename("B")).await.unwrap();
        provider.edit_room(g(), a, &RoomEdit::resize(4)).await.unwrap();
        let info = provider.room_info(g(), a).await.unwrap();
        assert_eq!(info.name, "B");
        assert_eq!(info.user_limit, Some(4));
        provider.edit_room(g(), a, &RoomEdit::resize(0)).await.unwrap();
        assert_eq!(provider.room(a).unwrap().user_limit, None);
    }
}
