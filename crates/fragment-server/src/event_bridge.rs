use std::sync::Arc;

use tokio::sync::broadcast;

use fragment_core::events::LifecycleEvent;

use crate::client::ClientRegistry;

/// Forwards the controller's lifecycle broadcast to subscribed WebSocket
/// clients.
pub struct EventBridge {
    registry: Arc<ClientRegistry>,
}

impl EventBridge {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    pub fn start(&self, mut rx: broadcast::Receiver<LifecycleEvent>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(json) = serialize_event(&event) {
                            registry.broadcast_event(event.guild_id(), &json);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

pub fn create_bridge(
    registry: Arc<ClientRegistry>,
    rx: broadcast::Receiver<LifecycleEvent>,
) -> tokio::task::JoinHandle<()> {
    EventBridge::new(registry).start(rx)
}

/// Events travel as their tagged JSON form: `{"type": "room_created", ..}`.
pub fn serialize_event(event: &LifecycleEvent) -> Option<String> {
    serde_json::to_string(event).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EventFilter;
    use fragment_core::ids::{EphemeralId, GuildId, RoomId, UserId};

    fn created(guild: u64) -> LifecycleEvent {
        LifecycleEvent::RoomCreated {
            guild_id: GuildId::new(guild),
            ephemeral_id: EphemeralId::new(),
            room_id: RoomId::new(20),
            parent_room_id: RoomId::new(10),
            owner: UserId::new(7),
        }
    }

    #[test]
    fn serialize_room_created() {
        let json = serialize_event(&created(1)).unwrap();
        assert!(json.contains("\"type\":\"room_created\""));
        assert!(json.contains("\"owner\":\"7\""));
    }

    #[test]
    fn serialize_reaped_event() {
        let json = serialize_event(&LifecycleEvent::RoomReaped {
            guild_id: GuildId::new(1),
            ephemeral_id: EphemeralId::new(),
            room_id: RoomId::new(20),
            forced: true,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"room_reaped\""));
        assert!(json.contains("\"forced\":true"));
    }

    #[tokio::test]
    async fn bridge_forwards_to_subscribers() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (tx, rx) = broadcast::channel(100);

        let (subscriber, mut sub_rx) = registry.register();
        let (other_guild, mut other_rx) = registry.register();
        let (_bystander, mut bystander_rx) = registry.register();
        registry.subscribe(&subscriber, EventFilter::default());
        registry
            .subscribe(
                &other_guild,
                EventFilter {
                    guild_id: Some(GuildId::new(2)),
                },
            );

        let handle = create_bridge(Arc::clone(&registry), rx);
        tx.send(created(1)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(sub_rx.try_recv().unwrap().contains("room_created"));
        assert!(other_rx.try_recv().is_err());
        assert!(bystander_rx.try_recv().is_err());

        handle.abort();
    }

    #[tokio::test]
    async fn bridge_stops_when_channel_closes() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (tx, rx) = broadcast::channel::<LifecycleEvent>(4);
        let handle = create_bridge(registry, rx);
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
