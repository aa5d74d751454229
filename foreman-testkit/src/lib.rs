//! Test support for foreman: sample job handlers, a fixed GPU probe,
//! in-process and recording launchers, and throwaway SQLite stores.

pub mod job;
pub mod mock;
pub mod store;

pub use job::*;
pub use mock::*;
pub use store::*;
