use thiserror::Error;

/// A submission was rejected before it reached the event store.
///
/// Surfaced to the caller as a client error; never changes stored state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("at least one recipient is required")]
    NoRecipients,

    #[error("invalid recipient address: {address}")]
    InvalidAddress { address: String },

    #[error("unparseable timestamp: {input}")]
    InvalidTimestamp { input: String },

    /// The local wall-clock time falls into a DST gap and names no instant.
    #[error("timestamp {input} does not exist in zone {zone}")]
    NonexistentLocalTime { input: String, zone: String },

    #[error("invalid time zone: {0}")]
    InvalidZone(String),
}

impl ValidationError {
    /// Short error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::EmptyField { .. } => "EMPTY_FIELD",
            ValidationError::NoRecipients => "NO_RECIPIENTS",
            ValidationError::InvalidAddress { .. } => "INVALID_ADDRESS",
            ValidationError::InvalidTimestamp { .. } => "INVALID_TIMESTAMP",
            ValidationError::NonexistentLocalTime { .. } => "NONEXISTENT_LOCAL_TIME",
            ValidationError::InvalidZone(_) => "INVALID_ZONE",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(String),

    /// Required settings absent for the active profile.
    #[error("{profile} profile requires: {}", missing.join(", "))]
    Missing {
        profile: String,
        missing: Vec<String>,
    },

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
