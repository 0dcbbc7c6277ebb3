//! RPC method handlers organized by domain.

use std::sync::Arc;

use fragment_core::errors::ProviderError;
use fragment_core::events::TransitionEvent;
use fragment_core::ids::{CategoryId, GuildId, RoomId, UserId};
use fragment_core::rooms::{OwnershipRecord, ParentRoomConfig, RoomEdit};
use fragment_engine::naming::{self, MAX_CHOSEN_NAME};
use fragment_engine::{ControllerHandle, LifecycleController};
use fragment_store::parents::{CategoryRepo, ParentRepo};
use fragment_store::{Database, StoreError};
use fragment_telemetry::TelemetryGuard;

use crate::bridge::BridgeProvider;
use crate::client::{ClientId, ClientRegistry, EventFilter};
use crate::rpc::{self, ErrorCode, RpcResponse};

/// Largest member cap an owner may set; 0 removes the cap.
pub const MAX_USER_LIMIT: i64 = 99;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub controller: LifecycleController,
    pub handle: ControllerHandle,
    pub db: Database,
    pub clients: Arc<ClientRegistry>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
    pub bridge: Option<Arc<BridgeProvider>>,
}

impl HandlerState {
    pub fn new(
        controller: LifecycleController,
        handle: ControllerHandle,
        db: Database,
        clients: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            controller,
            handle,
            db,
            clients,
            telemetry: None,
            bridge: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_bridge(mut self, bridge: Arc<BridgeProvider>) -> Self {
        self.bridge = Some(bridge);
        self
    }
}

/// Dispatch an RPC method to the appropriate handler. `client` is the
/// WebSocket connection the request arrived on, if any.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
    client: Option<&ClientId>,
) -> RpcResponse {
    match method {
        // Voice state
        "voice.transition" => voice_transition(state, params, id).await,

        // Registration
        "fragment.register" => fragment_register(state, params, id).await,
        "fragment.unregister" => fragment_unregister(state, params, id),
        "fragment.registerCategory" => fragment_register_category(state, params, id).await,
        "fragment.unregisterCategory" => fragment_unregister_category(state, params, id),
        "fragment.list" => fragment_list(state, params, id),

        // Owner commands
        "room.rename" => room_rename(state, params, id).await,
        "room.resize" => room_resize(state, params, id).await,
        "room.owner" => room_owner(state, params, id),
        "room.list" => room_list(state, params, id),

        // Subscriptions and bridge control
        "events.subscribe" => events_subscribe(state, params, id, client),
        "events.unsubscribe" => events_unsubscribe(state, id, client),
        "bridge.attach" => bridge_attach(state, id, client),

        // System
        "system.ping" | "health" => health(state, id),
        "telemetry.logs" => telemetry_logs(state, params, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

// ── Voice ───────────────────────────────────────────────────────────────

async fn voice_transition(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let parsed = (|| -> Result<TransitionEvent, String> {
        Ok(TransitionEvent {
            guild_id: rpc::require_id(params, "guildId")?,
            user_id: rpc::require_id(params, "userId")?,
            from_room_id: rpc::optional_id(params, "fromRoomId")?,
            to_room_id: rpc::optional_id(params, "toRoomId")?,
        })
    })();
    let event = match parsed {
        Ok(event) => event,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.handle.submit(event).await {
        Ok(()) => RpcResponse::success(id, serde_json::json!({"accepted": true})),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

// ── Registration ────────────────────────────────────────────────────────

async fn fragment_register(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let guild_id: GuildId = match rpc::require_id(params, "guildId") {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let room_id: RoomId = match rpc::require_id(params, "roomId") {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let info = match state.controller.provider().room_info(guild_id, room_id).await {
        Ok(info) => info,
        Err(e) => return provider_error(id, &e),
    };
    if state.controller.is_tracked(room_id) || naming::parse_fragment_name(&info.name).is_some() {
        return RpcResponse::invalid_params(id, "Ephemeral rooms cannot be registered as parents");
    }
    let Some(category_id) = info.category_id else {
        return RpcResponse::invalid_params(id, "Room must be inside a category");
    };

    let config = ParentRoomConfig {
        room_id,
        category_id,
        guild_id,
        name: info.name,
    };
    match ParentRepo::new(state.db.clone()).register(&config) {
        Ok(row) => to_success(id, &row),
        Err(e) => store_error(id, e),
    }
}

fn fragment_unregister(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let room_id: RoomId = match rpc::require_id(params, "roomId") {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match ParentRepo::new(state.db.clone()).unregister(room_id) {
        Ok(true) => RpcResponse::success(id, serde_json::json!({"removed": true})),
        Ok(false) => RpcResponse::error(id, ErrorCode::NotFound, format!("Room {room_id} is not registered")),
        Err(e) => store_error(id, e),
    }
}

async fn fragment_register_category(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let guild_id: GuildId = match rpc::require_id(params, "guildId") {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let category_id: CategoryId = match rpc::require_id(params, "categoryId") {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let name = rpc::optional_str(params, "name").unwrap_or_default();

    let rooms = match state.controller.provider().list_rooms(guild_id).await {
        Ok(rooms) => rooms,
        Err(e) => return provider_error(id, &e),
    };
    // Live fragments in the category must not become parents themselves.
    let rooms: Vec<_> = rooms
        .into_iter()
        .filter(|r| !state.controller.is_tracked(r.id) && naming::parse_fragment_name(&r.name).is_none())
        .collect();

    match CategoryRepo::new(state.db.clone()).register(guild_id, category_id, name, &rooms) {
        Ok((row, added)) => RpcResponse::success(
            id,
            serde_json::json!({
                "category": row,
                "roomsRegistered": added,
            }),
        ),
        Err(e) => store_error(id, e),
    }
}

fn fragment_unregister_category(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let category_id: CategoryId = match rpc::require_id(params, "categoryId") {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match CategoryRepo::new(state.db.clone()).unregister(category_id) {
        Ok(Some(rooms)) => RpcResponse::success(
            id,
            serde_json::json!({"removed": true, "roomsUnregistered": rooms}),
        ),
        Ok(None) => RpcResponse::error(
            id,
            ErrorCode::NotFound,
            format!("Category {category_id} is not registered"),
        ),
        Err(e) => store_error(id, e),
    }
}

fn fragment_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let guild_id: GuildId = match rpc::require_id(params, "guildId") {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let parents = ParentRepo::new(state.db.clone()).list(guild_id);
    let categories = CategoryRepo::new(state.db.clone()).list(guild_id);
    match (parents, categories) {
        (Ok(parents), Ok(categories)) => RpcResponse::success(
            id,
            serde_json::json!({
                "parents": parents,
                "categories": categories,
            }),
        ),
        (Err(e), _) | (_, Err(e)) => store_error(id, e),
    }
}

// ── Owner commands ──────────────────────────────────────────────────────

/// The room the caller currently owns, or the NOT_OWNER response.
fn owned_room(
    state: &HandlerState,
    params: &serde_json::Value,
    id: &Option<serde_json::Value>,
) -> Result<OwnershipRecord, RpcResponse> {
    let user_id: UserId =
        rpc::require_id(params, "userId").map_err(|e| RpcResponse::invalid_params(id.clone(), e))?;
    state.controller.ledger().room_owned_by(user_id).ok_or_else(|| {
        RpcResponse::error(id.clone(), ErrorCode::NotOwner, "You do not own an ephemeral room")
    })
}

async fn room_rename(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let name = match rpc::require_str(params, "name") {
        Ok(name) => name.trim(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    // The remaining characters of the platform limit hold the token suffix.
    if name.is_empty() || name.chars().count() > MAX_CHOSEN_NAME {
        return RpcResponse::invalid_params(
            id,
            format!("Name must be between 1 and {MAX_CHOSEN_NAME} characters"),
        );
    }
    let record = match owned_room(state, params, &id) {
        Ok(record) => record,
        Err(resp) => return resp,
    };

    // The token suffix stays so the room is still recognised after a restart.
    let full_name = naming::fragment_name(name, &record.ephemeral_id);
    let edit = RoomEdit::rename(full_name.clone());
    match state
        .controller
        .provider()
        .edit_room(record.guild_id, record.room_id, &edit)
        .await
    {
        Ok(()) => {
            tracing::info!(
                guild_id = %record.guild_id,
                room_id = %record.room_id,
                user_id = %record.owner,
                "room renamed"
            );
            RpcResponse::success(
                id,
                serde_json::json!({"roomId": record.room_id, "name": full_name}),
            )
        }
        Err(e) => provider_error(id, &e),
    }
}

async fn room_resize(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let limit = match rpc::optional_i64(params, "limit") {
        Some(limit) if (0..=MAX_USER_LIMIT).contains(&limit) => limit as u32,
        Some(_) => {
            return RpcResponse::invalid_params(
                id,
                format!("Limit must be between 0 and {MAX_USER_LIMIT}"),
            )
        }
        None => return RpcResponse::invalid_params(id, "missing parameter 'limit'"),
    };
    let record = match owned_room(state, params, &id) {
        Ok(record) => record,
        Err(resp) => return resp,
    };

    match state
        .controller
        .provider()
        .edit_room(record.guild_id, record.room_id, &RoomEdit::resize(limit))
        .await
    {
        Ok(()) => RpcResponse::success(
            id,
            serde_json::json!({"roomId": record.room_id, "userLimit": limit}),
        ),
        Err(e) => provider_error(id, &e),
    }
}

fn room_owner(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let ledger = state.controller.ledger();
    let record = match (
        rpc::optional_id::<RoomId>(params, "roomId"),
        rpc::optional_id::<UserId>(params, "userId"),
    ) {
        (Err(e), _) | (_, Err(e)) => return RpcResponse::invalid_params(id, e),
        (Ok(Some(room_id)), _) => ledger.by_room(room_id),
        (Ok(None), Ok(Some(user_id))) => ledger.room_owned_by(user_id),
        (Ok(None), Ok(None)) => {
            return RpcResponse::invalid_params(id, "one of 'roomId' or 'userId' is required")
        }
    };
    match record {
        Some(record) => to_success(id, &record),
        None => RpcResponse::error(id, ErrorCode::NotFound, "No owned ephemeral room matches"),
    }
}

fn room_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let guild_id: Option<GuildId> = match rpc::optional_id(params, "guildId") {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let rooms: Vec<_> = state
        .controller
        .rooms()
        .into_iter()
        .filter(|r| guild_id.is_none_or(|g| r.room.guild_id == g))
        .collect();
    RpcResponse::success(
        id,
        serde_json::json!({
            "rooms": rooms,
            "totalCount": rooms.len(),
        }),
    )
}

// ── Subscriptions & bridge ──────────────────────────────────────────────

fn require_client<'a>(
    client: Option<&'a ClientId>,
    id: &Option<serde_json::Value>,
) -> Result<&'a ClientId, RpcResponse> {
    client.ok_or_else(|| {
        RpcResponse::error(id.clone(), ErrorCode::InvalidRequest, "Requires a WebSocket connection")
    })
}

fn events_subscribe(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
    client: Option<&ClientId>,
) -> RpcResponse {
    let client = match require_client(client, &id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let guild_id = match rpc::optional_id(params, "guildId") {
        Ok(v) => v,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let subscribed = state.clients.subscribe(client, EventFilter { guild_id });
    RpcResponse::success(id, serde_json::json!({"subscribed": subscribed}))
}

fn events_unsubscribe(
    state: &Arc<HandlerState>,
    id: Option<serde_json::Value>,
    client: Option<&ClientId>,
) -> RpcResponse {
    let client = match require_client(client, &id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let was = state.clients.unsubscribe(client);
    RpcResponse::success(id, serde_json::json!({"unsubscribed": was}))
}

fn bridge_attach(
    state: &Arc<HandlerState>,
    id: Option<serde_json::Value>,
    client: Option<&ClientId>,
) -> RpcResponse {
    let client = match require_client(client, &id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(ref bridge) = state.bridge else {
        return RpcResponse::error(
            id,
            ErrorCode::BridgeUnavailable,
            "This daemon does not use a platform bridge",
        );
    };
    bridge.attach(client.clone());
    RpcResponse::success(id, serde_json::json!({"attached": true}))
}

// ── System ──────────────────────────────────────────────────────────────

fn telemetry_logs(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let disabled = || {
        serde_json::json!({
            "logs": [],
            "totalCount": 0,
            "enabled": false,
        })
    };
    let Some(ref telemetry) = state.telemetry else {
        return RpcResponse::success(id, disabled());
    };
    let Some(log_sink) = telemetry.logs() else {
        return RpcResponse::success(id, disabled());
    };

    let owned = |key: &str| rpc::optional_str(params, key).map(str::to_string);
    let query = fragment_telemetry::LogQuery {
        level: owned("level"),
        target: owned("target"),
        guild_id: owned("guildId"),
        room_id: owned("roomId"),
        since: owned("since"),
        limit: rpc::optional_i64(params, "limit").map(|v| v.clamp(1, 1000) as u32),
    };

    match log_sink.query(&query) {
        Ok(records) => RpcResponse::success(
            id,
            serde_json::json!({
                "totalCount": records.len(),
                "logs": records,
                "enabled": true,
            }),
        ),
        Err(e) => RpcResponse::internal_error(id, format!("Log query failed: {e}")),
    }
}

fn health(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(id, health_report(state))
}

/// Shared by `system.ping` and `GET /health`. Degraded when the database
/// is unreachable or a configured bridge has no client attached.
pub(crate) fn health_report(state: &HandlerState) -> serde_json::Value {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(true)
        })
        .unwrap_or(false);
    let bridge = match state.bridge {
        None => "local",
        Some(ref b) if b.is_attached() => "attached",
        Some(_) => "detached",
    };
    let healthy = db_ok && bridge != "detached";

    serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "components": {
            "database": if db_ok { "ok" } else { "error" },
            "bridge": bridge,
        },
        "liveRooms": state.controller.rooms().len(),
        "ownedRooms": state.controller.ledger().len(),
        "clients": state.clients.count(),
    })
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn to_success<T: serde::Serialize>(id: Option<serde_json::Value>, value: &T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(v) => RpcResponse::success(id, v),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

/// Platform denials are passed back verbatim so the caller sees the reason.
fn provider_error(id: Option<serde_json::Value>, e: &ProviderError) -> RpcResponse {
    let mut resp = RpcResponse::error(id, ErrorCode::ProviderError, e.to_string());
    if let Some(err) = resp.error.as_mut() {
        err.data = Some(serde_json::json!({"kind": e.error_kind()}));
    }
    resp
}

fn store_error(id: Option<serde_json::Value>, e: StoreError) -> RpcResponse {
    match e {
        StoreError::Conflict(msg) => RpcResponse::error(id, ErrorCode::Conflict, msg),
        StoreError::NotFound(msg) => RpcResponse::error(id, ErrorCode::NotFound, msg),
        other => RpcResponse::internal_error(id, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fragment_core::events::LifecycleEvent;
    use fragment_engine::{ControllerConfig, MemoryProvider, OwnershipLedger, ProviderOp};
    use fragment_store::StoreRegistry;
    use fragment_telemetry::SqliteLogSink;
    use serde_json::json;

    const GUILD: GuildId = GuildId::new(1);
    const CATEGORY: CategoryId = CategoryId::new(900);

    struct Fixture {
        state: Arc<HandlerState>,
        provider: Arc<MemoryProvider>,
        lobby: RoomId,
    }

    fn setup() -> Fixture {
        let db = Database::in_memory().unwrap();
        let provider = Arc::new(MemoryProvider::new());
        let lobby = provider.add_room(GUILD, "Lobby", Some(CATEGORY));
        let controller = LifecycleController::new(
            Arc::new(StoreRegistry::new(db.clone())),
            provider.clone(),
            Arc::new(OwnershipLedger::new()),
            ControllerConfig::default(),
        );
        let (handle, _join) = controller.start();
        provider.attach(handle.sender());
        let clients = Arc::new(ClientRegistry::new(32));
        Fixture {
            state: Arc::new(HandlerState::new(controller, handle, db, clients)),
            provider,
            lobby,
        }
    }

    async fn call(state: &Arc<HandlerState>, method: &str, params: serde_json::Value) -> RpcResponse {
        dispatch(state, method, &params, Some(json!(1)), None).await
    }

    /// Register the lobby and have `user` join it; returns the new room.
    async fn spawn_room(f: &Fixture, user: u64) -> RoomId {
        let resp = call(&f.state, "fragment.register", json!({"guildId": "1", "roomId": f.lobby.to_string()})).await;
        assert!(resp.success || resp.error_code() == Some("CONFLICT"));

        let mut events = f.state.controller.subscribe();
        f.provider.connect(GUILD, UserId::new(user), f.lobby).await;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let LifecycleEvent::RoomCreated { room_id, .. } = event {
                return room_id;
            }
        }
    }

    #[tokio::test]
    async fn unknown_method() {
        let f = setup();
        let resp = call(&f.state, "nope.nothing", json!({})).await;
        assert_eq!(resp.error_code(), Some("METHOD_NOT_FOUND"));
    }

    #[tokio::test]
    async fn health_check() {
        let f = setup();
        let resp = call(&f.state, "health", json!({})).await;
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "healthy");
        assert_eq!(result["components"]["bridge"], "local");
        assert_eq!(result["liveRooms"], 0);
    }

    #[tokio::test]
    async fn health_degraded_without_bridge_client() {
        let f = setup();
        let bridge = Arc::new(BridgeProvider::new(Arc::clone(&f.state.clients), Duration::from_secs(1)));
        let state = HandlerState::new(
            f.state.controller.clone(),
            f.state.handle.clone(),
            f.state.db.clone(),
            Arc::clone(&f.state.clients),
        )
        .with_bridge(bridge);
        let resp = call(&Arc::new(state), "system.ping", json!({})).await;
        assert_eq!(resp.result.unwrap()["status"], "degraded");
    }

    #[tokio::test]
    async fn register_and_list_parent() {
        let f = setup();
        let resp = call(&f.state, "fragment.register", json!({"guildId": 1, "roomId": f.lobby.to_string()})).await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(resp.result.unwrap()["name"], "Lobby");

        let again = call(&f.state, "fragment.register", json!({"guildId": 1, "roomId": f.lobby.to_string()})).await;
        assert_eq!(again.error_code(), Some("CONFLICT"));

        let list = call(&f.state, "fragment.list", json!({"guildId": "1"})).await;
        let result = list.result.unwrap();
        assert_eq!(result["parents"].as_array().unwrap().len(), 1);
        assert_eq!(result["categories"].as_array().unwrap().len(), 0);

        let removed = call(&f.state, "fragment.unregister", json!({"roomId": f.lobby.to_string()})).await;
        assert!(removed.success);
        let missing = call(&f.state, "fragment.unregister", json!({"roomId": f.lobby.to_string()})).await;
        assert_eq!(missing.error_code(), Some("NOT_FOUND"));
    }

    #[tokio::test]
    async fn register_unknown_room_reports_provider_error() {
        let f = setup();
        let resp = call(&f.state, "fragment.register", json!({"guildId": 1, "roomId": 424242})).await;
        assert_eq!(resp.error_code(), Some("PROVIDER_ERROR"));
        assert_eq!(resp.error.unwrap().data.unwrap()["kind"], "not_found");
    }

    #[tokio::test]
    async fn register_rejects_uncategorised_and_ephemeral_rooms() {
        let f = setup();
        let loose = f.provider.add_room(GUILD, "Loose", None);
        let resp = call(&f.state, "fragment.register", json!({"guildId": 1, "roomId": loose.to_string()})).await;
        assert_eq!(resp.error_code(), Some("INVALID_PARAMS"));

        let room = spawn_room(&f, 7).await;
        let resp = call(&f.state, "fragment.register", json!({"guildId": 1, "roomId": room.to_string()})).await;
        assert_eq!(resp.error_code(), Some("INVALID_PARAMS"));
    }

    #[tokio::test]
    async fn category_registration_round_trip() {
        let f = setup();
        f.provider.add_room(GUILD, "Gaming", Some(CATEGORY));
        f.provider.add_room(GUILD, "Elsewhere", Some(CategoryId::new(5)));

        let resp = call(
            &f.state,
            "fragment.registerCategory",
            json!({"guildId": 1, "categoryId": CATEGORY.to_string(), "name": "Voice"}),
        )
        .await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(resp.result.unwrap()["roomsRegistered"], 2);

        let again = call(&f.state, "fragment.registerCategory", json!({"guildId": 1, "categoryId": 900})).await;
        assert_eq!(again.error_code(), Some("CONFLICT"));

        let resp = call(&f.state, "fragment.unregisterCategory", json!({"categoryId": 900})).await;
        assert_eq!(resp.result.unwrap()["roomsUnregistered"], 2);
        let resp = call(&f.state, "fragment.unregisterCategory", json!({"categoryId": 900})).await;
        assert_eq!(resp.error_code(), Some("NOT_FOUND"));
    }

    #[tokio::test]
    async fn voice_transition_creates_room() {
        let f = setup();
        call(&f.state, "fragment.register", json!({"guildId": 1, "roomId": f.lobby.to_string()})).await;
        let mut events = f.state.controller.subscribe();

        f.provider.place(GUILD, UserId::new(7), f.lobby);
        let resp = call(
            &f.state,
            "voice.transition",
            json!({"guildId": "1", "userId": "7", "toRoomId": f.lobby.to_string()}),
        )
        .await;
        assert_eq!(resp.result.unwrap()["accepted"], true);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type(), "room_created");
    }

    #[tokio::test]
    async fn voice_transition_validates_ids() {
        let f = setup();
        let resp = call(&f.state, "voice.transition", json!({"guildId": "1"})).await;
        assert_eq!(resp.error_code(), Some("INVALID_PARAMS"));
        let resp = call(&f.state, "voice.transition", json!({"guildId": "1", "userId": "x"})).await;
        assert_eq!(resp.error_code(), Some("INVALID_PARAMS"));
    }

    #[tokio::test]
    async fn owner_commands_require_ownership() {
        let f = setup();
        let resp = call(&f.state, "room.rename", json!({"userId": 7, "name": "Mine"})).await;
        assert_eq!(resp.error_code(), Some("NOT_OWNER"));
        let resp = call(&f.state, "room.resize", json!({"userId": 7, "limit": 4})).await;
        assert_eq!(resp.error_code(), Some("NOT_OWNER"));
    }

    #[tokio::test]
    async fn owner_can_rename_and_resize() {
        let f = setup();
        let room = spawn_room(&f, 7).await;

        let resp = call(&f.state, "room.rename", json!({"userId": 7, "name": "Study group"})).await;
        assert!(resp.success, "{:?}", resp.error);
        let name = f.provider.room(room).unwrap().name;
        assert!(name.starts_with("Study group ["));
        assert!(naming::parse_fragment_name(&name).is_some());

        let resp = call(&f.state, "room.resize", json!({"userId": 7, "limit": 5})).await;
        assert!(resp.success);
        assert_eq!(f.provider.room(room).unwrap().user_limit, Some(5));

        let resp = call(&f.state, "room.resize", json!({"userId": 7, "limit": 0})).await;
        assert!(resp.success);
        assert_eq!(f.provider.room(room).unwrap().user_limit, None);

        let other = call(&f.state, "room.rename", json!({"userId": 8, "name": "Hijack"})).await;
        assert_eq!(other.error_code(), Some("NOT_OWNER"));
    }

    #[tokio::test]
    async fn rename_keeps_longest_allowed_name_whole() {
        let f = setup();
        let room = spawn_room(&f, 7).await;
        let chosen = "n".repeat(MAX_CHOSEN_NAME);

        let resp = call(&f.state, "room.rename", json!({"userId": 7, "name": chosen})).await;
        assert!(resp.success, "{:?}", resp.error);
        let name = f.provider.room(room).unwrap().name;
        assert!(name.starts_with(&format!("{chosen} [")));
        assert_eq!(name.chars().count(), naming::MAX_ROOM_NAME);

        let too_long = "n".repeat(MAX_CHOSEN_NAME + 1);
        let resp = call(&f.state, "room.rename", json!({"userId": 7, "name": too_long})).await;
        assert_eq!(resp.error_code(), Some("INVALID_PARAMS"));
    }

    #[tokio::test]
    async fn owner_command_validation() {
        let f = setup();
        spawn_room(&f, 7).await;
        let long = "x".repeat(MAX_CHOSEN_NAME + 1);
        for params in [
            json!({"userId": 7, "name": "   "}),
            json!({"userId": 7, "name": long}),
            json!({"userId": 7}),
        ] {
            let resp = call(&f.state, "room.rename", params).await;
            assert_eq!(resp.error_code(), Some("INVALID_PARAMS"));
        }
        for params in [json!({"userId": 7, "limit": 100}), json!({"userId": 7, "limit": -1})] {
            let resp = call(&f.state, "room.resize", params).await;
            assert_eq!(resp.error_code(), Some("INVALID_PARAMS"));
        }
    }

    #[tokio::test]
    async fn provider_denial_is_returned() {
        let f = setup();
        spawn_room(&f, 7).await;
        f.provider.fail_next(
            ProviderOp::EditRoom,
            ProviderError::Forbidden("Missing Permissions".into()),
        );
        let resp = call(&f.state, "room.rename", json!({"userId": 7, "name": "Nope"})).await;
        assert_eq!(resp.error_code(), Some("PROVIDER_ERROR"));
        assert!(resp.error.unwrap().message.contains("Missing Permissions"));
    }

    #[tokio::test]
    async fn owner_and_room_lookup() {
        let f = setup();
        let room = spawn_room(&f, 7).await;

        let by_room = call(&f.state, "room.owner", json!({"roomId": room.to_string()})).await;
        assert_eq!(by_room.result.unwrap()["owner"], "7");
        let by_user = call(&f.state, "room.owner", json!({"userId": 7})).await;
        assert_eq!(by_user.result.unwrap()["roomId"], room.to_string());
        let none = call(&f.state, "room.owner", json!({"userId": 8})).await;
        assert_eq!(none.error_code(), Some("NOT_FOUND"));
        let bad = call(&f.state, "room.owner", json!({})).await;
        assert_eq!(bad.error_code(), Some("INVALID_PARAMS"));

        let list = call(&f.state, "room.list", json!({"guildId": 1})).await;
        let result = list.result.unwrap();
        assert_eq!(result["totalCount"], 1);
        assert_eq!(result["rooms"][0]["owner"], "7");
        assert_eq!(result["rooms"][0]["state"], "active");
        let other = call(&f.state, "room.list", json!({"guildId": 2})).await;
        assert_eq!(other.result.unwrap()["totalCount"], 0);
    }

    #[tokio::test]
    async fn subscriptions_need_a_connection() {
        let f = setup();
        let resp = call(&f.state, "events.subscribe", json!({})).await;
        assert_eq!(resp.error_code(), Some("INVALID_REQUEST"));

        let (client, _rx) = f.state.clients.register();
        let resp = dispatch(&f.state, "events.subscribe", &json!({"guildId": 1}), None, Some(&client)).await;
        assert_eq!(resp.result.unwrap()["subscribed"], true);
        let resp = dispatch(&f.state, "events.unsubscribe", &json!({}), None, Some(&client)).await;
        assert_eq!(resp.result.unwrap()["unsubscribed"], true);
    }

    #[tokio::test]
    async fn bridge_attach_without_bridge() {
        let f = setup();
        let (client, _rx) = f.state.clients.register();
        let resp = dispatch(&f.state, "bridge.attach", &json!({}), None, Some(&client)).await;
        assert_eq!(resp.error_code(), Some("BRIDGE_UNAVAILABLE"));
    }

    #[tokio::test]
    async fn telemetry_logs_disabled_returns_empty() {
        let f = setup();
        let resp = call(&f.state, "telemetry.logs", json!({})).await;
        let result = resp.result.unwrap();
        assert_eq!(result["enabled"], false);
        assert_eq!(result["totalCount"], 0);
    }

    #[tokio::test]
    async fn telemetry_logs_enabled_queries_sink() {
        let f = setup();
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let state = HandlerState::new(
            f.state.controller.clone(),
            f.state.handle.clone(),
            f.state.db.clone(),
            Arc::clone(&f.state.clients),
        )
        .with_telemetry(Arc::new(TelemetryGuard::with_sink(sink)));
        let resp = call(&Arc::new(state), "telemetry.logs", json!({"level": "warn", "guildId": "1", "limit": 10})).await;
        let result = resp.result.unwrap();
        assert_eq!(result["enabled"], true);
        assert_eq!(result["totalCount"], 0);
    }
}
