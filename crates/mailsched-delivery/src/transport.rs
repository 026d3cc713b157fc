use std::sync::Arc;

use async_trait::async_trait;
use mailsched_core::config::{MailschedConfig, TransportKind};
use mailsched_core::{Event, EventId};
use thiserror::Error;
use tracing::info;

use crate::error::Result;
use crate::smtp::SmtpTransport;

/// How a send failed, as far as retrying is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Worth another attempt: timeouts, dropped connections, 4xx replies.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying cannot help: 5xx replies, malformed addresses.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Permanent(_))
    }
}

/// A message ready for the wire. One message goes to every recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub event_id: EventId,
    pub subject: String,
    pub body: String,
    pub to: Vec<String>,
}

impl OutgoingMail {
    pub fn render(event: &Event) -> Self {
        Self {
            event_id: event.id,
            subject: event.subject.clone(),
            body: event.content.clone(),
            to: event.recipients.clone(),
        }
    }
}

/// Anything that can put an [`OutgoingMail`] on its way.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    async fn send(&self, mail: &OutgoingMail) -> std::result::Result<(), TransportError>;
}

/// Logs each mail instead of sending it. Always succeeds.
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, mail: &OutgoingMail) -> std::result::Result<(), TransportError> {
        info!(
            event_id = mail.event_id,
            to = %mail.to.join(", "),
            subject = %mail.subject,
            body_len = mail.body.len(),
            "mail not sent (log transport)"
        );
        Ok(())
    }
}

/// Build the transport selected by `mail.transport` (or the profile default).
pub fn transport_from_config(config: &MailschedConfig) -> Result<Arc<dyn MailTransport>> {
    match config.transport_kind() {
        TransportKind::Log => Ok(Arc::new(LogTransport)),
        TransportKind::Smtp => Ok(Arc::new(SmtpTransport::from_config(
            &config.mail,
            config.delivery.send_timeout(),
        )?)),
    }
}
