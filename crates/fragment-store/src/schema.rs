/// SQL DDL for the fragment registry database.
/// Snowflakes are stored as TEXT so values above i64::MAX survive.
/// Stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS guilds (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fragment_categories (
    category_id TEXT PRIMARY KEY,
    guild_id TEXT NOT NULL REFERENCES guilds(id),
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS parent_rooms (
    room_id TEXT PRIMARY KEY,
    guild_id TEXT NOT NULL REFERENCES guilds(id),
    category_id TEXT NOT NULL,
    name TEXT NOT NULL,
    via_category TEXT REFERENCES fragment_categories(category_id) ON DELETE CASCADE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ownership (
    ephemeral_id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL UNIQUE,
    guild_id TEXT NOT NULL,
    parent_room_id TEXT NOT NULL,
    category_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    assigned_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_parent_rooms_guild ON parent_rooms(guild_id);
CREATE INDEX IF NOT EXISTS idx_parent_rooms_via ON parent_rooms(via_category);
CREATE INDEX IF NOT EXISTS idx_categories_guild ON fragment_categories(guild_id);
CREATE INDEX IF NOT EXISTS idx_ownership_owner ON ownership(owner_id);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
