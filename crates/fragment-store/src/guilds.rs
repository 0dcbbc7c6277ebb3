use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use fragment_core::ids::GuildId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuildRow {
    pub id: GuildId,
    pub name: String,
    pub created_at: String,
}

pub struct GuildRepo {
    db: Database,
}

impl GuildRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Make sure the guild exists. A provided name replaces the stored one;
    /// without one, a new row is named after its id.
    #[instrument(skip(self), fields(guild_id = %id))]
    pub fn ensure(&self, id: GuildId, name: Option<&str>) -> Result<GuildRow, StoreError> {
        self.db.with_conn(|conn| ensure_guild(conn, id, name))
    }

    #[instrument(skip(self), fields(guild_id = %id))]
    pub fn get(&self, id: GuildId) -> Result<GuildRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, created_at FROM guilds WHERE id = ?1")?;
            let mut rows = stmt.query([id.to_string()])?;
            match rows.next()? {
                Some(row) => row_to_guild(row),
                None => Err(StoreError::NotFound(format!("guild {id}"))),
            }
        })
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<GuildRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, created_at FROM guilds ORDER BY created_at")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_guild(row)?);
            }
            Ok(out)
        })
    }
}

/// Shared with the registration repos so guild creation happens inside
/// their transaction.
pub(crate) fn ensure_guild(
    conn: &rusqlite::Connection,
    id: GuildId,
    name: Option<&str>,
) -> Result<GuildRow, StoreError> {
    let now = Utc::now().to_rfc3339();
    let fallback = id.to_string();
    conn.execute(
        "INSERT INTO guilds (id, name, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO NOTHING",
        rusqlite::params![id.to_string(), name.unwrap_or(&fallback), now],
    )?;
    if let Some(name) = name {
        conn.execute(
            "UPDATE guilds SET name = ?1 WHERE id = ?2",
            rusqlite::params![name, id.to_string()],
        )?;
    }
    conn.query_row(
        "SELECT id, name, created_at FROM guilds WHERE id = ?1",
        [id.to_string()],
        |row| Ok(row_to_guild(row)),
    )?
}

fn row_to_guild(row: &rusqlite::Row<'_>) -> Result<GuildRow, StoreError> {
    Ok(GuildRow {
        id: row_helpers::get_parsed(row, 0, "guilds", "id")?,
        name: row_helpers::get(row, 1, "guilds", "name")?,
        created_at: row_helpers::get(row, 2, "guilds", "created_at")?,
    })
}
