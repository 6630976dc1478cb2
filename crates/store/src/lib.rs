//! `relink-store` — live store backed by a SQLite database.
//!
//! Table and column names come from `[store]` in the relink config; nothing
//! about the schema is assumed beyond an id column and an owner column per
//! record table.

mod sqlite;

pub use sqlite::SqliteStore;
