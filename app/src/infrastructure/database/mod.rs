mod json;
mod sqlite;

pub use self::{json::JsonDb, sqlite::SqliteDb};
pub(in crate::infrastructure) use self::json::QueueData;
