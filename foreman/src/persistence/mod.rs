/// SQLite persistence for jobs, events, checkpoints, resource locks and
/// scheduler settings.
///
/// This module provides `SqliteStore`, the SQLite-backed implementation of
/// the [`JobStore`](crate::queue::JobStore) trait.
pub mod sqlite;

pub use sqlite::SqliteStore;
