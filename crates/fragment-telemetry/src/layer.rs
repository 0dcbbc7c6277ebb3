use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::sink::{Entry, SqliteLogSink};

/// Guild and room a log line is about. Kept on spans so events inside a
/// watcher or handler span are attributed without repeating the ids.
#[derive(Clone, Debug, Default)]
struct RoomScope {
    guild_id: Option<String>,
    room_id: Option<String>,
}

impl RoomScope {
    fn is_empty(&self) -> bool {
        self.guild_id.is_none() && self.room_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.guild_id.is_some() && self.room_id.is_some()
    }

    fn inherit(&mut self, outer: &RoomScope) {
        if self.guild_id.is_none() {
            self.guild_id.clone_from(&outer.guild_id);
        }
        if self.room_id.is_none() {
            self.room_id.clone_from(&outer.room_id);
        }
    }
}

#[derive(Default)]
struct Captured {
    message: Option<String>,
    scope: RoomScope,
    extra: Map<String, Value>,
}

impl Captured {
    fn put(&mut self, name: &str, value: Value) {
        match (name, value) {
            ("message", Value::String(text)) => self.message = Some(text),
            ("guild_id", v) => self.scope.guild_id = Some(plain(v)),
            ("room_id", v) => self.scope.room_id = Some(plain(v)),
            (other, v) => {
                self.extra.insert(other.to_string(), v);
            }
        }
    }
}

fn plain(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Visit for Captured {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let text = format!("{value:?}");
        let text = match field.name() {
            "message" => text,
            _ => text.trim_matches('"').to_string(),
        };
        self.put(field.name(), Value::String(text));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field.name(), Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), value.into());
    }
}

/// Persists WARN and ERROR events into a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut captured = Captured::default();
        attrs.record(&mut captured);
        if captured.scope.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(captured.scope);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }

        let mut captured = Captured::default();
        event.record(&mut captured);

        if let Some(spans) = ctx.event_scope(event) {
            for span in spans {
                if captured.scope.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<RoomScope>() {
                    captured.scope.inherit(outer);
                }
            }
        }

        let fields = (!captured.extra.is_empty())
            .then(|| serde_json::to_string(&captured.extra).ok())
            .flatten();

        self.sink.write(Entry {
            logged_at: Utc::now().to_rfc3339(),
            level: meta.level().as_str().to_string(),
            target: meta.target().to_string(),
            message: captured.message.unwrap_or_default(),
            fields,
            guild_id: captured.scope.guild_id,
            room_id: captured.scope.room_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogQuery;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(f: impl FnOnce()) -> Vec<crate::LogRecord> {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(Arc::clone(&sink)));
        tracing::subscriber::with_default(subscriber, f);
        sink.query(&LogQuery::default()).unwrap()
    }

    #[test]
    fn only_warn_and_error_are_kept() {
        let rows = capture(|| {
            tracing::debug!("noise");
            tracing::info!("still noise");
            tracing::warn!("kept");
            tracing::error!("also kept");
        });
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].level, "ERROR");
        assert_eq!(rows[1].level, "WARN");
    }

    #[test]
    fn room_scope_comes_from_enclosing_span() {
        let rows = capture(|| {
            let span = tracing::info_span!("watch", guild_id = 5_u64, room_id = 77_u64);
            let _entered = span.enter();
            tracing::warn!(attempt = 2_u64, "delete failed");
        });
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message, "delete failed");
        assert_eq!(rows[0].guild_id.as_deref(), Some("5"));
        assert_eq!(rows[0].room_id.as_deref(), Some("77"));
        assert!(rows[0].fields.as_deref().unwrap_or_default().contains("attempt"));
    }

    #[test]
    fn event_ids_override_span_ids() {
        let rows = capture(|| {
            let span = tracing::info_span!("guild", guild_id = 5_u64, room_id = 1_u64);
            let _entered = span.enter();
            tracing::warn!(room_id = 2_u64, "moved elsewhere");
        });
        assert_eq!(rows[0].guild_id.as_deref(), Some("5"));
        assert_eq!(rows[0].room_id.as_deref(), Some("2"));
        assert!(rows[0].fields.is_none());
    }
}
