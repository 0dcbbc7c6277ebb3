use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use fragment_core::ids::GuildId;

const PING_EVERY: Duration = Duration::from_secs(30);
/// A client that has not answered a ping for this long is dropped.
pub const SILENCE_LIMIT: Duration = Duration::from_secs(90);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle events a client asked for. `guild_id: None` means every guild.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub guild_id: Option<GuildId>,
}

impl EventFilter {
    pub fn matches(&self, guild_id: GuildId) -> bool {
        self.guild_id.is_none_or(|g| g == guild_id)
    }
}

struct ClientSlot {
    tx: mpsc::Sender<String>,
    events: Option<EventFilter>,
    last_seen: Instant,
}

/// Connected WebSocket clients. Command callers, event subscribers and the
/// platform bridge all live here.
pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientSlot>,
    queue_depth: usize,
}

impl ClientRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            clients: DashMap::new(),
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.clients.insert(
            id.clone(),
            ClientSlot {
                tx,
                events: None,
                last_seen: Instant::now(),
            },
        );
        (id, rx)
    }

    pub fn unregister(&self, id: &ClientId) -> bool {
        self.clients.remove(id).is_some()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Start or replace a client's event subscription.
    pub fn subscribe(&self, id: &ClientId, filter: EventFilter) -> bool {
        match self.clients.get_mut(id) {
            Some(mut slot) => {
                slot.events = Some(filter);
                true
            }
            None => false,
        }
    }

    /// Returns whether the client had a subscription.
    pub fn unsubscribe(&self, id: &ClientId) -> bool {
        self.clients
            .get_mut(id)
            .is_some_and(|mut slot| slot.events.take().is_some())
    }

    pub fn mark_seen(&self, id: &ClientId) {
        if let Some(mut slot) = self.clients.get_mut(id) {
            slot.last_seen = Instant::now();
        }
    }

    /// Queue one message. A full queue drops the message rather than
    /// stalling the sender.
    pub fn send_to(&self, id: &ClientId, message: String) -> bool {
        let Some(tx) = self.clients.get(id).map(|slot| slot.tx.clone()) else {
            return false;
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(client_id = %id, bytes = dropped.len(), "client queue full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver an event to every subscriber whose filter takes `guild_id`.
    /// Returns how many clients accepted it.
    pub fn broadcast_event(&self, guild_id: GuildId, message: &str) -> usize {
        self.clients
            .iter()
            .filter(|slot| slot.events.is_some_and(|f| f.matches(guild_id)))
            .filter(|slot| slot.tx.try_send(message.to_owned()).is_ok())
            .count()
    }

    /// Drop clients silent for longer than `limit`.
    pub fn reap_silent(&self, limit: Duration) -> Vec<ClientId> {
        let silent: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|slot| slot.last_seen.elapsed() >= limit)
            .map(|slot| slot.key().clone())
            .collect();
        for id in &silent {
            self.clients.remove(id);
            tracing::info!(client_id = %id, "silent client dropped");
        }
        silent
    }
}

/// Pump one socket until either side closes. Outbound: the client's queue
/// plus periodic pings. Inbound: text frames go to `inbox`, pongs refresh
/// liveness.
pub async fn serve_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut outbox: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    inbox: mpsc::Sender<(ClientId, String)>,
) {
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_EVERY);
        ping.tick().await;
        loop {
            let frame = tokio::select! {
                queued = outbox.recv() => match queued {
                    Some(text) => WsMessage::Text(text.into()),
                    None => break,
                },
                _ = ping.tick() => WsMessage::Ping(Vec::new().into()),
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let reader_id = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            match frame {
                WsMessage::Text(text) => {
                    if inbox.send((reader_id.clone(), text.to_string())).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_registry.mark_seen(&reader_id),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }
    registry.unregister(&client_id);
}

/// Periodically drop clients that stopped answering pings.
pub fn start_cleanup_task(registry: Arc<ClientRegistry>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let dropped = registry.reap_silent(SILENCE_LIMIT);
            if !dropped.is_empty() {
                tracing::info!(dropped = dropped.len(), "silent client sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = ClientId::new();
        assert!(a.0.starts_with("client_"));
        assert_ne!(a, ClientId::new());
    }

    #[test]
    fn registration_lifecycle() {
        let registry = ClientRegistry::new(8);
        let (first, _rx1) = registry.register();
        let (second, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);

        assert!(registry.unregister(&first));
        assert!(!registry.unregister(&first));
        assert!(!registry.contains(&first));
        assert!(registry.contains(&second));
    }

    #[test]
    fn guild_filter() {
        let any = EventFilter::default();
        let only_one = EventFilter {
            guild_id: Some(GuildId::new(1)),
        };
        assert!(any.matches(GuildId::new(9)));
        assert!(only_one.matches(GuildId::new(1)));
        assert!(!only_one.matches(GuildId::new(2)));
    }

    #[test]
    fn events_go_to_matching_subscribers_only() {
        let registry = ClientRegistry::new(8);
        let (all, mut all_rx) = registry.register();
        let (second_guild, mut second_rx) = registry.register();
        let (_quiet, mut quiet_rx) = registry.register();

        assert!(registry.subscribe(&all, EventFilter::default()));
        assert!(registry.subscribe(
            &second_guild,
            EventFilter {
                guild_id: Some(GuildId::new(2)),
            },
        ));

        assert_eq!(registry.broadcast_event(GuildId::new(1), "first"), 1);
        assert_eq!(all_rx.try_recv().unwrap(), "first");
        assert!(second_rx.try_recv().is_err());
        assert!(quiet_rx.try_recv().is_err());

        assert_eq!(registry.broadcast_event(GuildId::new(2), "second"), 2);
        assert_eq!(second_rx.try_recv().unwrap(), "second");

        assert!(registry.unsubscribe(&all));
        assert!(!registry.unsubscribe(&all));
        assert_eq!(registry.broadcast_event(GuildId::new(1), "third"), 0);
    }

    #[test]
    fn subscribe_unknown_client() {
        let registry = ClientRegistry::new(8);
        assert!(!registry.subscribe(&ClientId::new(), EventFilter::default()));
        assert!(!registry.unsubscribe(&ClientId::new()));
    }

    #[test]
    fn send_to_one_client() {
        let registry = ClientRegistry::new(8);
        let (id, mut rx) = registry.register();
        assert!(registry.send_to(&id, "hello".into()));
        assert_eq!(rx.try_recv().unwrap(), "hello");
        assert!(!registry.send_to(&ClientId::new(), "nobody".into()));
    }

    #[test]
    fn full_queue_drops() {
        let registry = ClientRegistry::new(2);
        let (id, _rx) = registry.register();
        assert!(registry.send_to(&id, "1".into()));
        assert!(registry.send_to(&id, "2".into()));
        assert!(!registry.send_to(&id, "3".into()));
    }

    #[test]
    fn silent_clients_are_reaped() {
        let registry = ClientRegistry::new(8);
        let (id, _rx) = registry.register();
        assert!(registry.reap_silent(SILENCE_LIMIT).is_empty());
        assert_eq!(registry.reap_silent(Duration::ZERO), vec![id]);
        assert_eq!(registry.count(), 0);
    }
}
