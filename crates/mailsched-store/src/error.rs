use mailsched_core::{EventId, EventStatus, ValidationError};
use thiserror::Error;

/// Errors that can occur within the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No event with the given ID exists in the store.
    #[error("Event not found: {id}")]
    NotFound { id: EventId },

    /// The event is not in the state the operation requires.
    ///
    /// Indicates a consistency bug (e.g. marking a `done` event done again);
    /// callers log it and never swallow it.
    #[error("Invalid transition: event {id} is {status}, cannot {action}")]
    InvalidTransition {
        id: EventId,
        status: EventStatus,
        action: &'static str,
    },

    /// The new event failed validation; nothing was written.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A stored row could not be encoded or decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
