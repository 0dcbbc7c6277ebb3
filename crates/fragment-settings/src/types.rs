//! Settings type definitions.
//!
//! All types use camelCase on the wire and `#[serde(default)]`, so a
//! settings file only needs the keys it overrides.

use serde::{Deserialize, Serialize};

/// Root settings for the fragment daemon.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FragmentSettings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
    pub controller: ControllerSettings,
    pub bridge: BridgeSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound messages buffered per WebSocket client.
    pub max_send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9191,
            max_send_queue: 256,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Registry database. Relative paths resolve against `~/.fragment`.
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "database/fragment.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` wins when set.
    pub level: String,
    /// Persist warn+ records to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: "database/fragment-logs.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerSettings {
    /// How long a reaped room id keeps absorbing late events.
    pub cooldown_secs: u64,
    /// Idle time after which a watcher re-verifies its room with the provider.
    pub liveness_timeout_secs: u64,
    /// Capacity of the inbound transition queue.
    pub event_buffer: usize,
    /// Capacity of each room watcher's signal queue.
    pub watcher_buffer: usize,
    /// Adopt or reap leftover rooms at startup.
    pub recover_on_startup: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: 5,
            liveness_timeout_secs: 30 * 60,
            event_buffer: 1024,
            watcher_buffer: 64,
            recover_on_startup: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    /// Deadline for a platform bridge to answer a provider request.
    pub request_timeout_secs: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
        }
    }
}

impl FragmentSettings {
    /// Correct values that would make the controller misbehave.
    pub fn validate(&mut self) {
        let c = &mut self.controller;
        if c.event_buffer == 0 {
            tracing::warn!("controller.eventBuffer must be positive, using 1");
            c.event_buffer = 1;
        }
        if c.watcher_buffer == 0 {
            tracing::warn!("controller.watcherBuffer must be positive, using 1");
            c.watcher_buffer = 1;
        }
        if c.liveness_timeout_secs == 0 {
            tracing::warn!("controller.livenessTimeoutSecs must be positive, using default");
            c.liveness_timeout_secs = ControllerSettings::default().liveness_timeout_secs;
        }
        if self.bridge.request_timeout_secs == 0 {
            self.bridge.request_timeout_secs = BridgeSettings::default().request_timeout_secs;
        }
    }
}
