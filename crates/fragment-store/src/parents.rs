//! Registrations: which rooms are fragment parents, and which categories
//! were registered wholesale.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use fragment_core::ids::{CategoryId, GuildId, RoomId};
use fragment_core::rooms::{ParentRoomConfig, RoomInfo};

use crate::database::Database;
use crate::error::StoreError;
use crate::guilds::ensure_guild;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRoomRow {
    #[serde(flatten)]
    pub config: ParentRoomConfig,
    /// Set when the row was created by a category registration.
    pub via_category: Option<CategoryId>,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRow {
    pub category_id: CategoryId,
    pub guild_id: GuildId,
    pub name: String,
    pub created_at: String,
}

pub struct ParentRepo {
    db: Database,
}

impl ParentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a single parent room. Fails with `Conflict` if it already is one.
    #[instrument(skip(self, config), fields(guild_id = %config.guild_id, room_id = %config.room_id))]
    pub fn register(&self, config: &ParentRoomConfig) -> Result<ParentRoomRow, StoreError> {
        self.db.with_tx(|tx| {
            ensure_guild(tx, config.guild_id, None)?;
            insert_parent(tx, config, None)
        })
    }

    /// Returns whether a registration was removed.
    #[instrument(skip(self), fields(room_id = %room_id))]
    pub fn unregister(&self, room_id: RoomId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM parent_rooms WHERE room_id = ?1",
                [room_id.to_string()],
            )?;
            Ok(n > 0)
        })
    }

    #[instrument(skip(self), fields(room_id = %room_id))]
    pub fn get(&self, room_id: RoomId) -> Result<Option<ParentRoomRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT room_id, category_id, guild_id, name, via_category, created_at
                 FROM parent_rooms WHERE room_id = ?1",
            )?;
            let mut rows = stmt.query([room_id.to_string()])?;
            rows.next()?.map(row_to_parent).transpose()
        })
    }

    /// Category under which a parent's fragments are created.
    pub fn category_of(&self, room_id: RoomId) -> Result<Option<CategoryId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT category_id FROM parent_rooms WHERE room_id = ?1")?;
            let mut rows = stmt.query([room_id.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_helpers::get_parsed(row, 0, "parent_rooms", "category_id")?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self), fields(guild_id = %guild_id))]
    pub fn list(&self, guild_id: GuildId) -> Result<Vec<ParentRoomRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT room_id, category_id, guild_id, name, via_category, created_at
                 FROM parent_rooms WHERE guild_id = ?1 ORDER BY name, room_id",
            )?;
            let mut rows = stmt.query([guild_id.to_string()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_parent(row)?);
            }
            Ok(out)
        })
    }

    /// Guilds with at least one parent room.
    pub fn guilds(&self) -> Result<Vec<GuildId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT guild_id FROM parent_rooms ORDER BY guild_id")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_helpers::get_parsed(row, 0, "parent_rooms", "guild_id")?);
            }
            Ok(out)
        })
    }
}

pub struct CategoryRepo {
    db: Database,
}

impl CategoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a category and every voice room currently in it as a parent.
    /// Rooms already registered individually are left as they are.
    #[instrument(skip(self, rooms), fields(guild_id = %guild_id, category_id = %category_id, rooms = rooms.len()))]
    pub fn register(
        &self,
        guild_id: GuildId,
        category_id: CategoryId,
        name: &str,
        rooms: &[RoomInfo],
    ) -> Result<(CategoryRow, usize), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_tx(|tx| {
            ensure_guild(tx, guild_id, None)?;
            let inserted = tx.execute(
                "INSERT INTO fragment_categories (category_id, guild_id, name, created_at)
                 VALUES (?1, ?2, ?3, ?4) ON CONFLICT(category_id) DO NOTHING",
                rusqlite::params![category_id.to_string(), guild_id.to_string(), name, now],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("category {category_id} already registered")));
            }

            let mut added = 0;
            for room in rooms.iter().filter(|r| r.category_id == Some(category_id)) {
                let config = ParentRoomConfig {
                    room_id: room.id,
                    category_id,
                    guild_id,
                    name: room.name.clone(),
                };
                match insert_parent(tx, &config, Some(category_id)) {
                    Ok(_) => added += 1,
                    Err(StoreError::Conflict(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            Ok((
                CategoryRow {
                    category_id,
                    guild_id,
                    name: name.to_string(),
                    created_at: now.clone(),
                },
                added,
            ))
        })
    }

    /// Remove a category registration and the parent rows it created.
    /// Returns `None` if the category was not registered, otherwise the
    /// number of parent rooms removed with it.
    #[instrument(skip(self), fields(category_id = %category_id))]
    pub fn unregister(&self, category_id: CategoryId) -> Result<Option<usize>, StoreError> {
        self.db.with_tx(|tx| {
            let removed_parents = tx.execute(
                "DELETE FROM parent_rooms WHERE via_category = ?1",
                [category_id.to_string()],
            )?;
            let removed = tx.execute(
                "DELETE FROM fragment_categories WHERE category_id = ?1",
                [category_id.to_string()],
            )?;
            Ok((removed > 0).then_some(removed_parents))
        })
    }

    #[instrument(skip(self), fields(guild_id = %guild_id))]
    pub fn list(&self, guild_id: GuildId) -> Result<Vec<CategoryRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT category_id, guild_id, name, created_at FROM fragment_categories
                 WHERE guild_id = ?1 ORDER BY name",
            )?;
            let mut rows = stmt.query([guild_id.to_string()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(CategoryRow {
                    category_id: row_helpers::get_parsed(row, 0, "fragment_categories", "category_id")?,
                    guild_id: row_helpers::get_parsed(row, 1, "fragment_categories", "guild_id")?,
                    name: row_helpers::get(row, 2, "fragment_categories", "name")?,
                    created_at: row_helpers::get(row, 3, "fragment_categories", "created_at")?,
                });
            }
            Ok(out)
        })
    }
}

fn insert_parent(
    conn: &rusqlite::Connection,
    config: &ParentRoomConfig,
    via_category: Option<CategoryId>,
) -> Result<ParentRoomRow, StoreError> {
    let now = Utc::now().to_rfc3339();
    let inserted = conn.execute(
        "INSERT INTO parent_rooms (room_id, guild_id, category_id, name, via_category, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT(room_id) DO NOTHING",
        rusqlite::params![
            config.room_id.to_string(),
            config.guild_id.to_string(),
            config.category_id.to_string(),
            config.name,
            via_category.map(|c| c.to_string()),
            now,
        ],
    )?;
    if inserted == 0 {
        return Err(StoreError::Conflict(format!(
            "room {} already registered",
            config.room_id
        )));
    }
    Ok(ParentRoomRow {
        config: config.clone(),
        via_category,
        created_at: now,
    })
}

fn row_to_parent(row: &rusqlite::Row<'_>) -> Result<ParentRoomRow, StoreError> {
    const T: &str = "parent_rooms";
    Ok(ParentRoomRow {
        config: ParentRoomConfig {
            room_id: row_helpers::get_parsed(row, 0, T, "room_id")?,
            category_id: row_helpers::get_parsed(row, 1, T, "category_id")?,
            guild_id: row_helpers::get_parsed(row, 2, T, "guild_id")?,
            name: row_helpers::get(row, 3, T, "name")?,
        },
        via_category: row_helpers::get_parsed_opt(row, 4, T, "via_category")?,
        created_at: row_helpers::get(row, 5, T, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUILD: GuildId = GuildId::new(1);

    fn config(room: u64, category: u64) -> ParentRoomConfig {
        ParentRoomConfig {
            room_id: RoomId::new(room),
            category_id: CategoryId::new(category),
            guild_id: GUILD,
            name: format!("room-{room}"),
        }
    }

    fn info(room: u64, category: Option<u64>) -> RoomInfo {
        RoomInfo {
            id: RoomId::new(room),
            guild_id: GUILD,
            name: format!("room-{room}"),
            category_id: category.map(CategoryId::new),
            user_limit: None,
        }
    }

    #[test]
    fn register_and_lookup() {
        let repo = ParentRepo::new(Database::in_memory().unwrap());
        repo.register(&config(10, 5)).unwrap();
        assert_eq!(repo.category_of(RoomId::new(10)).unwrap(), Some(CategoryId::new(5)));
        assert_eq!(repo.category_of(RoomId::new(11)).unwrap(), None);
        let row = repo.get(RoomId::new(10)).unwrap().unwrap();
        assert_eq!(row.config, config(10, 5));
        assert_eq!(row.via_category, None);
    }

    #[test]
    fn double_register_conflicts() {
        let repo = ParentRepo::new(Database::in_memory().unwrap());
        repo.register(&config(10, 5)).unwrap();
        assert!(matches!(repo.register(&config(10, 5)), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn unregister_reports_removal() {
        let repo = ParentRepo::new(Database::in_memory().unwrap());
        repo.register(&config(10, 5)).unwrap();
        assert!(repo.unregister(RoomId::new(10)).unwrap());
        assert!(!repo.unregister(RoomId::new(10)).unwrap());
        assert!(repo.get(RoomId::new(10)).unwrap().is_none());
    }

    #[test]
    fn list_and_guilds() {
        let repo = ParentRepo::new(Database::in_memory().unwrap());
        repo.register(&config(10, 5)).unwrap();
        repo.register(&config(11, 5)).unwrap();
        repo.register(&ParentRoomConfig {
            guild_id: GuildId::new(2),
            ..config(12, 6)
        })
        .unwrap();
        assert_eq!(repo.list(GUILD).unwrap().len(), 2);
        assert_eq!(repo.guilds().unwrap(), vec![GUILD, GuildId::new(2)]);
    }

    #[test]
    fn category_registration_adds_rooms_in_category_only() {
        let db = Database::in_memory().unwrap();
        let parents = ParentRepo::new(db.clone());
        let categories = CategoryRepo::new(db);
        parents.register(&config(10, 5)).unwrap();

        let rooms = vec![info(10, Some(5)), info(11, Some(5)), info(12, Some(6)), info(13, None)];
        let (row, added) = categories
            .register(GUILD, CategoryId::new(5), "Voice", &rooms)
            .unwrap();
        assert_eq!(row.name, "Voice");
        assert_eq!(added, 1);
        assert!(parents.get(RoomId::new(11)).unwrap().is_some());
        assert!(parents.get(RoomId::new(12)).unwrap().is_none());
        assert_eq!(categories.list(GUILD).unwrap().len(), 1);
    }

    #[test]
    fn category_unregister_removes_only_its_rows() {
        let db = Database::in_memory().unwrap();
        let parents = ParentRepo::new(db.clone());
        let categories = CategoryRepo::new(db);
        parents.register(&config(10, 5)).unwrap();
        categories
            .register(GUILD, CategoryId::new(5), "Voice", &[info(10, Some(5)), info(11, Some(5))])
            .unwrap();

        assert_eq!(categories.unregister(CategoryId::new(5)).unwrap(), Some(1));
        assert!(parents.get(RoomId::new(10)).unwrap().is_some());
        assert!(parents.get(RoomId::new(11)).unwrap().is_none());
        assert_eq!(categories.unregister(CategoryId::new(5)).unwrap(), None);
    }

    #[test]
    fn category_double_register_conflicts() {
        let categories = CategoryRepo::new(Database::in_memory().unwrap());
        categories.register(GUILD, CategoryId::new(5), "Voice", &[]).unwrap();
        assert!(matches!(
            categories.register(GUILD, CategoryId::new(5), "Voice", &[]),
            Err(StoreError::Conflict(_))
        ));
    }
}
