use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use fragment_settings::ServerSettings;

use crate::client::{self, ClientId, ClientRegistry};
use crate::event_bridge;
use crate::handlers::{self, HandlerState};
use crate::rpc::{ErrorCode, RpcRequest, RpcResponse};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9191,
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

const CLIENT_SWEEP_EVERY: std::time::Duration = std::time::Duration::from_secs(60);

/// Bind the listener and spawn the server tasks. The client registry is
/// the one inside `handler_state`, shared with the platform bridge.
/// The HTTP server stops when the controller's cancel token fires.
pub async fn start(
    config: ServerConfig,
    handler_state: Arc<HandlerState>,
) -> Result<ServerHandle, std::io::Error> {
    let clients = Arc::clone(&handler_state.clients);
    let (inbox_tx, inbox_rx) = mpsc::channel::<(ClientId, String)>(1024);

    let background = vec![
        event_bridge::create_bridge(Arc::clone(&clients), handler_state.controller.subscribe()),
        client::start_cleanup_task(Arc::clone(&clients), CLIENT_SWEEP_EVERY),
        tokio::spawn(process_rpc_messages(
            inbox_rx,
            Arc::clone(&handler_state),
            Arc::clone(&clients),
        )),
    ];

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let bound = listener.local_addr()?;
    tracing::info!(addr = %bound, "listening");

    let router = build_router(AppState {
        handler_state: Arc::clone(&handler_state),
        client_registry: clients,
        message_tx: inbox_tx,
    });
    let cancel = handler_state.controller.cancel_token();
    let server = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
            tracing::error!(error = %e, "http server failed");
        }
    });

    Ok(ServerHandle {
        port: bound.port(),
        server,
        background,
    })
}

/// Running server. Dropping it leaves the tasks running; [`stopped`]
/// waits for the HTTP side and then tears the rest down.
///
/// [`stopped`]: ServerHandle::stopped
pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub async fn stopped(self) {
        let _ = self.server.await;
        for task in self.background {
            task.abort();
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    tracing::info!(client_id = %client_id, "client connected");

    client::serve_connection(
        socket,
        client_id.clone(),
        rx,
        Arc::clone(&state.client_registry),
        state.message_tx,
    )
    .await;

    if let Some(ref bridge) = state.handler_state.bridge {
        bridge.detach(&client_id);
    }
    tracing::info!(client_id = %client_id, "client gone");
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = handlers::health_report(&state.handler_state);
    let code = match report["status"].as_str() {
        Some("healthy") => axum::http::StatusCode::OK,
        _ => axum::http::StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, axum::Json(report))
}

/// Methods whose requests must reach the controller in arrival order.
const ORDERED_METHODS: &[&str] = &["voice.transition"];

/// Route incoming WebSocket text. Bridge replies carry `success` and
/// complete a pending provider call inline. Transitions go to a single
/// forwarder task so the controller sees them in the order they arrived.
/// Every other request is dispatched on its own task.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    // Unbounded so a full controller queue never stalls bridge replies.
    let (ordered_tx, ordered_rx) = mpsc::unbounded_channel();
    tokio::spawn(forward_in_order(
        ordered_rx,
        Arc::clone(&state),
        Arc::clone(&registry),
    ));

    while let Some((client_id, raw_message)) = rx.recv().await {
        let value: serde_json::Value = match serde_json::from_str(&raw_message) {
            Ok(v) => v,
            Err(_) => {
                reply(&registry, &client_id, &RpcResponse::parse_error());
                continue;
            }
        };

        if value.get("method").is_none() && value.get("success").is_some() {
            complete_bridge_call(&state, &client_id, value);
            continue;
        }

        let request: RpcRequest = match serde_json::from_value(value) {
            Ok(req) => req,
            Err(e) => {
                let resp = RpcResponse::error(None, ErrorCode::InvalidRequest, e.to_string());
                reply(&registry, &client_id, &resp);
                continue;
            }
        };

        if ORDERED_METHODS.contains(&request.method.as_str()) {
            if ordered_tx.send((client_id, request)).is_err() {
                tracing::error!("transition forwarder stopped");
            }
            continue;
        }

        let state = Arc::clone(&state);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            answer(&state, &registry, &client_id, request).await;
        });
    }
}

async fn forward_in_order(
    mut rx: mpsc::UnboundedReceiver<(ClientId, RpcRequest)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, request)) = rx.recv().await {
        answer(&state, &registry, &client_id, request).await;
    }
}

async fn answer(state: &Arc<HandlerState>, registry: &ClientRegistry, client_id: &ClientId, request: RpcRequest) {
    let params = request.params.unwrap_or(serde_json::json!({}));
    let response = handlers::dispatch(state, &request.method, &params, request.id, Some(client_id)).await;
    reply(registry, client_id, &response);
}

fn complete_bridge_call(state: &HandlerState, client_id: &ClientId, value: serde_json::Value) {
    let Some(ref bridge) = state.bridge else {
        return;
    };
    if bridge.attached_client().as_ref() != Some(client_id) {
        tracing::debug!(client_id = %client_id, "response from a client that is not the bridge");
        return;
    }
    match serde_json::from_value::<RpcResponse>(value) {
        Ok(response) => {
            bridge.complete(response);
        }
        Err(e) => tracing::warn!(client_id = %client_id, error = %e, "malformed bridge response"),
    }
}

fn reply(registry: &ClientRegistry, client_id: &ClientId, response: &RpcResponse) {
    if let Ok(json) = serde_json::to_string(response) {
        registry.send_to(client_id, json);
    }
}
