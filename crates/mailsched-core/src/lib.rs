//! `mailsched-core`: types shared by every mailsched crate.
//!
//! Holds the event model, boundary validation for schedule requests, the
//! dispatch queue hand-off type, the health registry and layered config.

pub mod config;
pub mod error;
pub mod health;
pub mod queue;
pub mod submission;
pub mod types;

pub use error::{ConfigError, ValidationError};
pub use health::{HealthHandle, HealthRegistry};
pub use queue::{dispatch_queue, DeliveryJob, JobSender, SharedJobReceiver};
pub use submission::{parse_timestamp, InputZone, RecipientsInput, SubmitRequest};
pub use types::{Event, EventId, EventStatus, NewEvent, Recipients};
