//! Logging for the fragment daemon: a `tracing` subscriber writing JSON
//! lines to stdout, plus an optional SQLite store of warnings and errors
//! that the `telemetry.logs` method reads back.

mod layer;
mod sink;

pub use layer::SqliteLogLayer;
pub use sink::{LogQuery, LogRecord, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
            log_to_sqlite: false,
            log_db_path: PathBuf::from("fragment-logs.db"),
        }
    }
}

/// Handle to the persisted log store, if one was opened.
pub struct TelemetryGuard {
    sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    pub fn with_sink(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.sink.as_deref()
    }
}

/// Install the global subscriber. Must be called at most once.
///
/// A log store that fails to open is reported on stderr and skipped; the
/// daemon still runs with stdout logging only.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let stdout = if config.json {
        fmt::layer().json().with_span_list(true).boxed()
    } else {
        fmt::layer().boxed()
    };

    let sink = config
        .log_to_sqlite
        .then(|| SqliteLogSink::new(&config.log_db_path))
        .and_then(|opened| match opened {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                eprintln!("fragment: log store unavailable at {}: {e}", config.log_db_path.display());
                None
            }
        });

    tracing_subscriber::registry()
        .with(stdout.with_filter(filter))
        .with(sink.clone().map(SqliteLogLayer::new))
        .init();

    TelemetryGuard { sink }
}
