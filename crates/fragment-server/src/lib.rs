pub mod bridge;
pub mod client;
pub mod event_bridge;
pub mod handlers;
pub mod rpc;
pub mod server;

pub use bridge::{BridgeError, BridgeProvider};
pub use client::ClientRegistry;
pub use handlers::HandlerState;
pub use server::{start, ServerConfig, ServerHandle};
