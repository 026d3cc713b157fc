//! `mailsched-store`: SQLite-backed event store.
//!
//! Events are created `pending`, claimed by a dispatcher with a single
//! conditional update, and finished (`done` / `failed`) by a delivery worker.
//! Rows are never deleted here; they double as the audit log.

pub mod db;
pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{EventStore, ListFilter, StatusCounts};
