//! `mailsched-delivery`: turns claimed events into sent mail.
//!
//! A [`WorkerPool`] drains the dispatch queue. Each job reloads its event,
//! checks it is still `claimed`, and makes one attempt through a
//! [`MailTransport`]. Transient failures come back after exponential backoff
//! until the [`RetryPolicy`] budget is spent; permanent failures end the
//! event at once.

pub mod error;
pub mod retry;
pub mod smtp;
pub mod transport;
pub mod worker;

pub use error::{DeliveryError, Result};
pub use retry::RetryPolicy;
pub use smtp::SmtpTransport;
pub use transport::{transport_from_config, LogTransport, MailTransport, OutgoingMail, TransportError};
pub use worker::{DeliveryWorker, Outcome, WorkerPool};
