//! Database module: SQLite-backed outbox store.
//!
//! This module is split into two submodules:
//! - `model`: row structs and their conversion into [`crate::model::OutboxMessage`].
//! - `repo`: pool setup, migrations and the [`SqliteOutboxStore`] itself.
//!
//! External modules should import from `outbox_relay::db`; the repository
//! API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::StatusCounts;
