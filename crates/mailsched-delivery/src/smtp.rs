use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use mailsched_core::config::MailConfig;
use tracing::debug;

use crate::error::{DeliveryError, Result};
use crate::transport::{MailTransport, OutgoingMail, TransportError};

/// SMTP relay transport.
///
/// `use_ssl` connects with implicit TLS, `use_tls` upgrades with STARTTLS,
/// neither sends in plaintext (local relays and test servers only).
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    server: String,
}

impl SmtpTransport {
    pub fn from_config(mail: &MailConfig, timeout: Duration) -> Result<Self> {
        let sender = mail
            .default_sender
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| mail.username.as_deref().filter(|s| !s.trim().is_empty()))
            .ok_or_else(|| DeliveryError::Config("mail.default_sender is not set".into()))?;
        let from: Mailbox = sender
            .parse()
            .map_err(|e| DeliveryError::Config(format!("invalid sender '{sender}': {e}")))?;

        let builder = if mail.use_ssl {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&mail.server)
        } else if mail.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&mail.server)
        } else {
            Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                &mail.server,
            ))
        };
        let mut builder = builder
            .map_err(|e| DeliveryError::Config(format!("SMTP relay {}: {e}", mail.server)))?
            .port(mail.port)
            .timeout(Some(timeout));

        if let (Some(user), Some(pass)) = (&mail.username, &mail.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
            server: format!("{}:{}", mail.server, mail.port),
        })
    }

    fn build_message(&self, mail: &OutgoingMail) -> std::result::Result<Message, TransportError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(mail.subject.clone())
            .header(ContentType::TEXT_PLAIN);

        for addr in &mail.to {
            let mailbox: Mailbox = addr.parse().map_err(|e| {
                TransportError::Permanent(format!("invalid recipient '{addr}': {e}"))
            })?;
            builder = builder.to(mailbox);
        }

        builder
            .body(mail.body.clone())
            .map_err(|e| TransportError::Permanent(format!("build message: {e}")))
    }
}

/// Permanent SMTP replies (5xx) fail the event; everything else is retried.
fn classify(err: lettre::transport::smtp::Error) -> TransportError {
    if err.is_permanent() {
        TransportError::Permanent(err.to_string())
    } else {
        TransportError::Transient(err.to_string())
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, mail: &OutgoingMail) -> std::result::Result<(), TransportError> {
        let message = self.build_message(mail)?;
        let response = self.mailer.send(message).await.map_err(classify)?;
        debug!(
            event_id = mail.event_id,
            server = %self.server,
            code = %response.code(),
            "SMTP accepted message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MailConfig {
        MailConfig {
            server: "localhost".into(),
            port: 2525,
            use_tls: false,
            default_sender: Some("Scheduler <noreply@example.com>".into()),
            ..MailConfig::default()
        }
    }

    fn mail(to: &[&str]) -> OutgoingMail {
        OutgoingMail {
            event_id: 1,
            subject: "Hello".into(),
            body: "Body".into(),
            to: to.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn message_carries_every_recipient() {
        let transport = SmtpTransport::from_config(&config(), Duration::from_secs(5)).unwrap();
        let message = transport
            .build_message(&mail(&["a@x.com", "b@y.org"]))
            .unwrap();
        assert_eq!(message.envelope().to().len(), 2);
        assert_eq!(
            message.envelope().from().map(|a| a.to_string()),
            Some("noreply@example.com".to_string())
        );
    }

    #[tokio::test]
    async fn bad_recipient_is_permanent() {
        let transport = SmtpTransport::from_config(&config(), Duration::from_secs(5)).unwrap();
        let err = transport.build_message(&mail(&["not an address"])).unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn username_doubles_as_sender() {
        let cfg = MailConfig {
            default_sender: None,
            username: Some("ops@example.com".into()),
            password: Some("secret".into()),
            ..config()
        };
        assert!(SmtpTransport::from_config(&cfg, Duration::from_secs(5)).is_ok());
    }

    #[tokio::test]
    async fn tls_modes_build() {
        let ssl = MailConfig {
            use_ssl: true,
            port: 465,
            ..config()
        };
        let starttls = MailConfig {
            use_tls: true,
            ..config()
        };
        assert!(SmtpTransport::from_config(&ssl, Duration::from_secs(5)).is_ok());
        assert!(SmtpTransport::from_config(&starttls, Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn invalid_sender_is_config_error() {
        let cfg = MailConfig {
            default_sender: Some("nope".into()),
            ..config()
        };
        assert!(matches!(
            SmtpTransport::from_config(&cfg, Duration::from_secs(5)),
            Err(DeliveryError::Config(_))
        ));
    }
}
