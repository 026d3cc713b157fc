use thiserror::Error;

/// Errors that stop a delivery job or prevent the worker from starting.
///
/// Transport failures are not errors here; they are recorded on the event
/// and surface as an [`crate::Outcome`].
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Store error: {0}")]
    Store(#[from] mailsched_store::StoreError),

    /// The mail settings cannot produce a working transport.
    #[error("Transport config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DeliveryError>;
