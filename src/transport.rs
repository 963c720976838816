//! Outbound transport: message building and SMTP delivery via lettre.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::config::SmtpConfig;
use crate::error::{ConfigError, DeliveryError};

/// A fully resolved email, ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    /// Attached as an HTML alternative only when non-empty.
    pub html: String,
}

impl OutgoingEmail {
    /// Build the MIME message.
    pub fn to_message(&self) -> Result<Message, DeliveryError> {
        let mut builder = Message::builder()
            .from(parse_mailbox(&self.from)?)
            .subject(self.subject.clone());
        for to in &self.to {
            builder = builder.to(parse_mailbox(to)?);
        }

        let message = if self.html.is_empty() {
            builder
                .header(ContentType::TEXT_PLAIN)
                .body(self.text.clone())
        } else {
            builder.multipart(MultiPart::alternative_plain_html(
                self.text.clone(),
                self.html.clone(),
            ))
        };
        message.map_err(|e| DeliveryError::Build(e.to_string()))
    }
}

/// Parse an address, e.g. `user@example.com` or `Name <user@example.com>`.
pub fn parse_mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| DeliveryError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Something that can deliver an [`OutgoingEmail`].
///
/// Failures are transient: the caller leaves the email unsent for the next run.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError>;
}

// ── SMTP ────────────────────────────────────────────────────────────

/// SMTP relay transport.
pub struct SmtpMailer {
    transport: SmtpTransport,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, ConfigError> {
        let mut builder = SmtpTransport::relay(&config.host)
            .map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_HOST".into(),
                message: format!("SMTP relay error: {e}"),
            })?
            .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                password.expose_secret().to_string(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError> {
        let message = email.to_message()?;
        let transport = self.transport.clone();

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| DeliveryError::Join(e.to_string()))?
            .map_err(|e| DeliveryError::Send(format!("SMTP send failed: {e}")))?;

        tracing::info!(recipients = email.to.len(), subject = %email.subject, "Email sent");
        Ok(())
    }
}

// ── In-memory ───────────────────────────────────────────────────────

/// Transport that keeps sent emails in memory.
///
/// Used for dry runs and tests; `fail_next` makes the next sends fail.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<OutgoingEmail>>,
    failures: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail with a delivery error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MailTransport for MemoryTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), DeliveryError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeliveryError::Send("simulated transport failure".into()));
        }

        // Build the message so invalid addresses fail here like they would over SMTP.
        email.to_message()?;
        tracing::info!(recipients = email.to.len(), subject = %email.subject, "Email recorded");
        self.sent
            .lock()
            .map_err(|e| DeliveryError::Send(format!("transport lock poisoned: {e}")))?
            .push(email.clone());
        Ok(())
    }
}
