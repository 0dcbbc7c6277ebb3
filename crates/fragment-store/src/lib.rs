pub mod database;
pub mod error;
pub mod guilds;
pub mod ownership;
pub mod parents;
pub mod registry;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use registry::StoreRegistry;
