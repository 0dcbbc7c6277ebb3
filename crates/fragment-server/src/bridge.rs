//! Room provider that forwards platform calls to an attached WebSocket
//! client (the chat-platform bot) and waits for its answers.
//!
//! Requests go out as `{"method": "platform.<op>", "params": {..}, "id": n}`.
//! The bridge replies with the normal response envelope carrying the same
//! `id`; error codes use the provider error kinds (`not_found`,
//! `forbidden`, `unavailable`, anything else is a rejection).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use fragment_core::errors::ProviderError;
use fragment_core::ids::{CategoryId, GuildId, RoomId, UserId};
use fragment_core::provider::RoomProvider;
use fragment_core::rooms::{RoomEdit, RoomInfo};

use crate::client::{ClientId, ClientRegistry};
use crate::rpc::{RpcRequest, RpcResponse};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no platform bridge attached")]
    NotAttached,
    #[error("bridge send queue rejected the request")]
    SendFailed,
    #[error("bridge did not answer within {0:?}")]
    Timeout(Duration),
    #[error("bridge disconnected before answering")]
    Dropped,
    #[error("{code}: {message}")]
    Remote { code: String, message: String },
    #[error("malformed bridge reply: {0}")]
    Decode(String),
}

impl From<BridgeError> for ProviderError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::NotAttached | BridgeError::SendFailed | BridgeError::Dropped => {
                ProviderError::Unavailable(e.to_string())
            }
            BridgeError::Timeout(d) => ProviderError::Timeout(d),
            BridgeError::Remote { code, message } => ProviderError::from_kind(&code, message),
            BridgeError::Decode(msg) => ProviderError::Rejected(msg),
        }
    }
}

pub struct BridgeProvider {
    clients: Arc<ClientRegistry>,
    attached: Mutex<Option<ClientId>>,
    pending: DashMap<u64, oneshot::Sender<RpcResponse>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl BridgeProvider {
    pub fn new(clients: Arc<ClientRegistry>, timeout: Duration) -> Self {
        Self {
            clients,
            attached: Mutex::new(None),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Route platform calls to `client`. A previously attached client is
    /// replaced and its in-flight requests fail.
    pub fn attach(&self, client: ClientId) {
        let previous = self.attached.lock().replace(client.clone());
        if previous.is_some_and(|p| p != client) {
            self.pending.clear();
        }
        info!(client_id = %client, "platform bridge attached");
    }

    /// Forget `client` if it is the attached bridge. Returns whether it was.
    pub fn detach(&self, client: &ClientId) -> bool {
        let mut attached = self.attached.lock();
        if attached.as_ref() != Some(client) {
            return false;
        }
        *attached = None;
        drop(attached);
        self.pending.clear();
        warn!(client_id = %client, "platform bridge detached");
        true
    }

    pub fn is_attached(&self) -> bool {
        self.attached.lock().is_some()
    }

    pub fn attached_client(&self) -> Option<ClientId> {
        self.attached.lock().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Hand a response from the bridge to its waiting caller. Returns false
    /// for unknown or already expired ids.
    pub fn complete(&self, response: RpcResponse) -> bool {
        let Some(id) = response.id.as_ref().and_then(|v| v.as_u64()) else {
            return false;
        };
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => {
                debug!(request_id = id, "late or unknown bridge response");
                false
            }
        }
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        let client = self.attached_client().ok_or(BridgeError::NotAttached)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = RpcRequest {
            method: method.to_string(),
            params: Some(params),
            id: Some(json!(id)),
        };
        let text = serde_json::to_string(&request).map_err(|e| BridgeError::Decode(e.to_string()))?;
        if !self.clients.send_to(&client, text) {
            self.pending.remove(&id);
            return Err(BridgeError::SendFailed);
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(BridgeError::Dropped),
            Err(_) => {
                self.pending.remove(&id);
                return Err(BridgeError::Timeout(self.timeout));
            }
        };

        if response.success {
            Ok(response.result.unwrap_or(serde_json::Value::Null))
        } else {
            let (code, message) = response
                .error
                .map(|e| (e.code, e.message))
                .unwrap_or_else(|| ("rejected".to_string(), "unspecified failure".to_string()));
            Err(BridgeError::Remote { code, message })
        }
    }

    async fn call_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ProviderError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| BridgeError::Decode(format!("{method}: {e}")).into())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedRoom {
    room_id: RoomId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Occupants {
    user_ids: Vec<UserId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AfkRoom {
    #[serde(default)]
    room_id: Option<RoomId>,
}

#[derive(Deserialize)]
struct RoomList {
    rooms: Vec<RoomInfo>,
}

#[async_trait]
impl RoomProvider for BridgeProvider {
    async fn create_room(
        &self,
        guild_id: GuildId,
        name: &str,
        category_id: CategoryId,
    ) -> Result<RoomId, ProviderError> {
        let created: CreatedRoom = self
            .call_as(
                "platform.createRoom",
                json!({"guildId": guild_id, "name": name, "categoryId": category_id}),
            )
            .await?;
        Ok(created.room_id)
    }

    async fn move_member(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<(), ProviderError> {
        self.call(
            "platform.moveMember",
            json!({"guildId": guild_id, "userId": user_id, "roomId": room_id}),
        )
        .await?;
        Ok(())
    }

    async fn delete_room(&self, guild_id: GuildId, room_id: RoomId) -> Result<(), ProviderError> {
        self.call("platform.deleteRoom", json!({"guildId": guild_id, "roomId": room_id}))
            .await?;
        Ok(())
    }

    async fn occupants(&self, guild_id: GuildId, room_id: RoomId) -> Result<Vec<UserId>, ProviderError> {
        let occupants: Occupants = self
            .call_as("platform.occupants", json!({"guildId": guild_id, "roomId": room_id}))
            .await?;
        Ok(occupants.user_ids)
    }

    async fn room_info(&self, guild_id: GuildId, room_id: RoomId) -> Result<RoomInfo, ProviderError> {
        self.call_as("platform.roomInfo", json!({"guildId": guild_id, "roomId": room_id}))
            .await
    }

    async fn afk_room(&self, guild_id: GuildId) -> Result<Option<RoomId>, ProviderError> {
        let afk: AfkRoom = self
            .call_as("platform.afkRoom", json!({"guildId": guild_id}))
            .await?;
        Ok(afk.room_id)
    }

    async fn edit_room(
        &self,
        guild_id: GuildId,
        room_id: RoomId,
        edit: &RoomEdit,
    ) -> Result<(), ProviderError> {
        self.call(
            "platform.editRoom",
            json!({"guildId": guild_id, "roomId": room_id, "edit": edit}),
        )
        .await?;
        Ok(())
    }

    async fn list_rooms(&self, guild_id: GuildId) -> Result<Vec<RoomInfo>, ProviderError> {
        let list: RoomList = self
            .call_as("platform.listRooms", json!({"guildId": guild_id}))
            .await?;
        Ok(list.rooms)
    }
}
