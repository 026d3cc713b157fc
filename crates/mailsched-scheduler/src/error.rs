use thiserror::Error;

/// Errors that can occur within the dispatcher.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The event store failed; the tick is abandoned and retried next interval.
    #[error("Store error: {0}")]
    Store(#[from] mailsched_store::StoreError),

    /// Every worker is gone; nothing can be dispatched any more.
    #[error("Dispatch queue closed")]
    QueueClosed,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
