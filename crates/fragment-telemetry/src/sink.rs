use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS logs (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    logged_at TEXT NOT NULL,
    level     TEXT NOT NULL,
    target    TEXT NOT NULL,
    message   TEXT NOT NULL,
    fields    TEXT,
    guild_id  TEXT,
    room_id   TEXT
);
CREATE INDEX IF NOT EXISTS logs_by_level ON logs(level);
CREATE INDEX IF NOT EXISTS logs_by_room ON logs(room_id);
CREATE INDEX IF NOT EXISTS logs_by_time ON logs(logged_at);
";

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

/// One persisted log line as returned by `telemetry.logs`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub guild_id: Option<String>,
    pub room_id: Option<String>,
}

impl LogRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            timestamp: row.get("logged_at")?,
            level: row.get("level")?,
            target: row.get("target")?,
            message: row.get("message")?,
            fields: row.get("fields")?,
            guild_id: row.get("guild_id")?,
            room_id: row.get("room_id")?,
        })
    }
}

/// Filters for [`SqliteLogSink::query`]. All set filters must match.
/// `target` is a substring match, `since` an RFC 3339 lower bound.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub guild_id: Option<String>,
    pub room_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogQuery {
    fn to_sql(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        // `?` in a clause is replaced by the numbered placeholder.
        let mut add = |clause: &str, value: String| {
            values.push(value);
            clauses.push(clause.replacen('?', &format!("?{}", values.len()), 1));
        };
        if let Some(level) = &self.level {
            add("level = ?", level.to_uppercase());
        }
        if let Some(target) = &self.target {
            add(r"target LIKE ? ESCAPE '\'", format!("%{}%", escape_like(target)));
        }
        if let Some(guild) = &self.guild_id {
            add("guild_id = ?", guild.clone());
        }
        if let Some(room) = &self.room_id {
            add("room_id = ?", room.clone());
        }
        if let Some(since) = &self.since {
            add("logged_at >= ?", since.clone());
        }

        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        (
            format!("SELECT * FROM logs{filter} ORDER BY id DESC LIMIT {limit}"),
            values,
        )
    }
}

/// Make `%`, `_` and `\` match literally under `ESCAPE '\'`.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Row about to be written by the layer.
pub(crate) struct Entry {
    pub logged_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub guild_id: Option<String>,
    pub room_id: Option<String>,
}

/// Warn-and-above log store. Lets failed deletes and bridge faults be
/// looked up after the fact through `telemetry.logs`.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> rusqlite::Result<Self> {
        if let Some(dir) = db_path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // Errors are swallowed: logging a failed log write would recurse.
    pub(crate) fn write(&self, entry: Entry) {
        let _ = self.conn.lock().execute(
            "INSERT INTO logs (logged_at, level, target, message, fields, guild_id, room_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.logged_at,
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.guild_id,
                entry.room_id,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, query: &LogQuery) -> rusqlite::Result<Vec<LogRecord>> {
        let (sql, values) = query.to_sql();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), LogRecord::from_row)?;
        rows.collect()
    }

    pub fn count(&self) -> rusqlite::Result<i64> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }

    /// Delete entries logged before `cutoff` (RFC 3339).
    pub fn prune_before(&self, cutoff: &str) -> rusqlite::Result<usize> {
        self.conn
            .lock()
            .execute("DELETE FROM logs WHERE logged_at < ?1", [cutoff])
    }
}
