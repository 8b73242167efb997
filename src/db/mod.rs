//! Database module: row models and SQL repositories.
//!
//! - `model`: row shapes returned by queries and their conversion into domain types.
//! - `repo`: SQL-only functions over the SQLite pool.
//!
//! Callers import from `punch_kiosk::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::QueueEntryRow;
