//! Persistence layer: every table the session core consumes or produces.
//!
//! One SQLite connection behind a `Mutex`, commit-per-statement, no
//! multi-row transactions. Persistence failures on the hot call path are
//! logged and swallowed by callers — a conversation never aborts because a
//! message row failed to write.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::{DbError, Result};
pub use store::Database;
