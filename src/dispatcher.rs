//! Dispatch of due emails through a [`MailTransport`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::EmailerConfig;
use crate::error::{DatabaseError, Error};
use crate::expander::AddressExpander;
use crate::model::Email;
use crate::render::Renderer;
use crate::store::{EmailStore, EventStore};
use crate::subject::extract_subject;
use crate::transport::{MailTransport, OutgoingEmail};

/// What happened to one due email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent { recipients: usize },
    /// Nobody left to deliver to; the email is closed without sending.
    NoAddresses,
    /// Another run marked it sent first.
    AlreadySent,
}

/// Summary of one dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub due: usize,
    pub sent: usize,
    pub no_addresses: usize,
    pub failed: usize,
}

/// Sends every due, unsent email and marks it sent.
pub struct Dispatcher {
    config: EmailerConfig,
    emails: Arc<dyn EmailStore>,
    events: Arc<dyn EventStore>,
    expander: AddressExpander,
    renderer: Arc<dyn Renderer>,
    transport: Arc<dyn MailTransport>,
}

impl Dispatcher {
    pub fn new(
        config: EmailerConfig,
        emails: Arc<dyn EmailStore>,
        events: Arc<dyn EventStore>,
        expander: AddressExpander,
        renderer: Arc<dyn Renderer>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            config,
            emails,
            events,
            expander,
            renderer,
            transport,
        }
    }

    /// Send everything due at `now`.
    ///
    /// A failed email stays unsent and is retried next run. A missing or
    /// unparseable configured sender is a configuration problem and aborts
    /// the run.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<DispatchReport, Error> {
        let due = self.emails.due_unsent_emails(now).await?;
        let mut report = DispatchReport {
            due: due.len(),
            ..Default::default()
        };

        for email in &due {
            match self.dispatch(email).await {
                Ok(DispatchOutcome::Sent { .. }) => report.sent += 1,
                Ok(DispatchOutcome::NoAddresses) => report.no_addresses += 1,
                Ok(DispatchOutcome::AlreadySent) => {}
                Err(e @ Error::Config(_)) => return Err(e),
                Err(e) => {
                    report.failed += 1;
                    error!(email_id = %email.id, event_id = %email.event_id, "Email dispatch failed: {e}");
                }
            }
        }

        info!(
            due = report.due,
            sent = report.sent,
            no_addresses = report.no_addresses,
            failed = report.failed,
            "Dispatched due emails"
        );
        Ok(report)
    }

    /// Render, address and send one email, then mark it sent.
    pub async fn dispatch(&self, email: &Email) -> Result<DispatchOutcome, Error> {
        let from = self
            .config
            .resolve_from_address(email.from_address.as_deref())?
            .to_string();

        let addresses = self.expander.expand(email).await?;
        if addresses.is_empty() {
            debug!(email_id = %email.id, "No deliverable addresses, closing email");
            self.emails.mark_sent(email.id, Utc::now()).await?;
            return Ok(DispatchOutcome::NoAddresses);
        }

        let event = self
            .events
            .get_event(email.event_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "event".into(),
                id: email.event_id.to_string(),
            })?;
        let rendered = self.renderer.render(&event).await?;

        let subject = if email.subject.is_empty() {
            let content = if rendered.html.is_empty() {
                &rendered.text
            } else {
                &rendered.html
            };
            extract_subject(content, self.config.subject_truncate_length)
        } else {
            email.subject.clone()
        };

        let outgoing = OutgoingEmail {
            from,
            to: addresses,
            subject,
            text: rendered.text,
            html: rendered.html,
        };
        self.transport.send(&outgoing).await?;

        if !self.emails.mark_sent(email.id, Utc::now()).await? {
            warn!(email_id = %email.id, "Email was already marked sent");
            return Ok(DispatchOutcome::AlreadySent);
        }
        Ok(DispatchOutcome::Sent {
            recipients: outgoing.to.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::error::ConfigError;
    use crate::model::{EmailDraft, EntityId, EntityKind, Source, Unsubscription};
    use crate::render::TemplateRenderer;
    use crate::resolver::RecipientResolver;
    use crate::store::LibSqlBackend;
    use crate::transport::MemoryTransport;

    struct Fixture {
        db: Arc<LibSqlBackend>,
        transport: Arc<MemoryTransport>,
        dispatcher: Dispatcher,
        source: Source,
    }

    async fn fixture_with(config: EmailerConfig) -> Fixture {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let resolver = RecipientResolver::new(&config, db.clone(), db.clone());
        let dispatcher = Dispatcher::new(
            config,
            db.clone(),
            db.clone(),
            AddressExpander::new(resolver),
            Arc::new(TemplateRenderer::new("/nonexistent")),
            transport.clone(),
        );
        Fixture {
            db,
            transport,
            dispatcher,
            source: Source::from("test_source"),
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(EmailerConfig {
            default_from_address: Some("test@example.com".into()),
            ..EmailerConfig::default()
        })
        .await
    }

    impl Fixture {
        async fn recipient(&self, address: &str) -> EntityId {
            self.db
                .add_entity(None, json!({ "email": address }))
                .await
                .unwrap()
                .id
        }

        async fn email(
            &self,
            recipients: &[EntityId],
            context: serde_json::Value,
            subject: &str,
            scheduled: DateTime<Utc>,
        ) -> Email {
            let event = self
                .db
                .add_event(&self.source, context, scheduled, &[])
                .await
                .unwrap();
            let email = EmailDraft {
                event_id: event.id,
                source: self.source.clone(),
                recipients: recipients.iter().copied().collect(),
                sub_entity_kind: None,
                subject: subject.into(),
                from_address: None,
                scheduled,
            }
            .into_email();
            assert!(self.db.insert_email_if_absent(&email).await.unwrap());
            email
        }

        async fn stored(&self, email: &Email) -> Email {
            self.db.get_email(email.id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn sends_due_email_and_marks_it_sent() {
        let f = fixture().await;
        let a = f.recipient("test1@example.com").await;
        let b = f.recipient("test2@example.com").await;
        let email = f
            .email(
                &[a, b],
                json!({"html": "<html><head><title>Hello!</title></head></html>", "text": "Email Body."}),
                "",
                Utc::now() - Duration::minutes(1),
            )
            .await;

        let report = f.dispatcher.run_due(Utc::now()).await.unwrap();
        assert_eq!(report.sent, 1);

        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "test@example.com");
        assert_eq!(sent[0].to, vec!["test1@example.com", "test2@example.com"]);
        assert_eq!(sent[0].subject, "Hello!");
        assert_eq!(sent[0].text, "Email Body.");
        assert!(f.stored(&email).await.sent.is_some());
    }

    #[tokio::test]
    async fn stored_subject_wins() {
        let f = fixture().await;
        let a = f.recipient("test1@example.com").await;
        f.email(
            &[a],
            json!({"text": "Body line"}),
            "Explicit",
            Utc::now() - Duration::minutes(1),
        )
        .await;

        f.dispatcher.run_due(Utc::now()).await.unwrap();
        assert_eq!(f.transport.sent()[0].subject, "Explicit");
    }

    #[tokio::test]
    async fn subject_falls_back_to_text_body() {
        let f = fixture().await;
        let a = f.recipient("test1@example.com").await;
        f.email(
            &[a],
            json!({"text": " Small content \nmore"}),
            "",
            Utc::now() - Duration::minutes(1),
        )
        .await;

        f.dispatcher.run_due(Utc::now()).await.unwrap();
        let sent = f.transport.sent();
        assert_eq!(sent[0].subject, "Small content");
        assert_eq!(sent[0].html, "");
    }

    #[tokio::test]
    async fn future_and_sent_emails_are_left_alone() {
        let f = fixture().await;
        let a = f.recipient("test1@example.com").await;
        let future = f
            .email(&[a], json!({}), "later", Utc::now() + Duration::days(1))
            .await;
        let done = f
            .email(&[a], json!({}), "done", Utc::now() - Duration::days(1))
            .await;
        f.db.mark_sent(done.id, Utc::now()).await.unwrap();

        let report = f.dispatcher.run_due(Utc::now()).await.unwrap();
        assert_eq!(report, DispatchReport::default());
        assert!(f.transport.sent().is_empty());
        assert!(f.stored(&future).await.sent.is_none());
    }

    #[tokio::test]
    async fn sent_is_set_once() {
        let f = fixture().await;
        let a = f.recipient("test1@example.com").await;
        let email = f
            .email(&[a], json!({}), "once", Utc::now() - Duration::minutes(1))
            .await;

        f.dispatcher.run_due(Utc::now()).await.unwrap();
        let first = f.stored(&email).await.sent;
        f.dispatcher.run_due(Utc::now()).await.unwrap();

        assert_eq!(f.transport.sent().len(), 1);
        assert_eq!(f.stored(&email).await.sent, first);
    }

    #[tokio::test]
    async fn from_override_is_used() {
        let f = fixture().await;
        let a = f.recipient("test1@example.com").await;
        let event = f
            .db
            .add_event(&f.source, json!({}), Utc::now(), &[])
            .await
            .unwrap();
        let email = EmailDraft {
            event_id: event.id,
            source: f.source.clone(),
            recipients: BTreeSet::from([a]),
            sub_entity_kind: None,
            subject: "s".into(),
            from_address: Some("custom@example.com".into()),
            scheduled: Utc::now() - Duration::minutes(1),
        }
        .into_email();
        f.db.insert_email_if_absent(&email).await.unwrap();

        f.dispatcher.run_due(Utc::now()).await.unwrap();
        assert_eq!(f.transport.sent()[0].from, "custom@example.com");
    }

    #[tokio::test]
    async fn missing_sender_aborts_the_run() {
        let f = fixture_with(EmailerConfig::default()).await;
        let a = f.recipient("test1@example.com").await;
        let email = f
            .email(&[a], json!({}), "s", Utc::now() - Duration::minutes(1))
            .await;

        let err = f.dispatcher.run_due(Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_retryable());
        assert!(f.stored(&email).await.sent.is_none());
    }

    #[tokio::test]
    async fn transport_failure_leaves_email_unsent() {
        let f = fixture().await;
        let a = f.recipient("test1@example.com").await;
        let email = f
            .email(&[a], json!({}), "s", Utc::now() - Duration::minutes(1))
            .await;

        f.transport.fail_next(1);
        let report = f.dispatcher.run_due(Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(f.stored(&email).await.sent.is_none());

        let report = f.dispatcher.run_due(Utc::now()).await.unwrap();
        assert_eq!(report.sent, 1);
        assert!(f.stored(&email).await.sent.is_some());
    }

    #[tokio::test]
    async fn one_failure_does_not_block_others() {
        let f = fixture().await;
        let a = f.recipient("test1@example.com").await;
        f.email(&[a], json!({}), "first", Utc::now() - Duration::minutes(2))
            .await;
        f.email(&[a], json!({}), "second", Utc::now() - Duration::minutes(1))
            .await;

        f.transport.fail_next(1);
        let report = f.dispatcher.run_due(Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(f.transport.sent()[0].subject, "second");
    }

    #[tokio::test]
    async fn malformed_recipient_does_not_block_the_others() {
        let f = fixture().await;
        let good = f.recipient("good@example.com").await;
        let bad = f.recipient("not an address").await;
        let email = f
            .email(&[good, bad], json!({}), "s", Utc::now() - Duration::minutes(1))
            .await;

        let report = f.dispatcher.run_due(Utc::now()).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(f.transport.sent()[0].to, vec!["good@example.com"]);
        assert!(f.stored(&email).await.sent.is_some());

        let report = f.dispatcher.run_due(Utc::now()).await.unwrap();
        assert_eq!(report.due, 0);
        assert_eq!(f.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn malformed_configured_sender_aborts_the_run() {
        let f = fixture_with(EmailerConfig {
            default_from_address: Some("not an address".into()),
            ..EmailerConfig::default()
        })
        .await;
        let a = f.recipient("test1@example.com").await;
        let email = f
            .email(&[a], json!({}), "s", Utc::now() - Duration::minutes(1))
            .await;

        let err = f.dispatcher.run_due(Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::InvalidValue { .. })));
        assert!(f.stored(&email).await.sent.is_none());
    }

    #[tokio::test]
    async fn nobody_left_closes_the_email() {
        let f = fixture().await;
        let a = f.recipient("test1@example.com").await;
        let email = f
            .email(&[a], json!({}), "s", Utc::now() - Duration::minutes(1))
            .await;
        f.db.add_unsubscription(&Unsubscription {
            entity: a,
            source: f.source.clone(),
            medium: f.dispatcher.config.medium(),
        })
        .await
        .unwrap();

        let report = f.dispatcher.run_due(Utc::now()).await.unwrap();
        assert_eq!(report.no_addresses, 1);
        assert!(f.transport.sent().is_empty());
        assert!(f.stored(&email).await.sent.is_some());
    }

    #[tokio::test]
    async fn group_email_fans_out_at_send_time() {
        let f = fixture().await;
        let team = f.db.add_entity(None, json!({})).await.unwrap().id;
        let user = EntityKind::from("user");
        let member = f
            .db
            .add_entity(Some(&user), json!({"email": "member@example.com"}))
            .await
            .unwrap()
            .id;
        f.db.add_relationship(team, member).await.unwrap();

        let event = f
            .db
            .add_event(&f.source, json!({}), Utc::now(), &[])
            .await
            .unwrap();
        let email = EmailDraft {
            event_id: event.id,
            source: f.source.clone(),
            recipients: BTreeSet::from([team]),
            sub_entity_kind: Some(user),
            subject: "Digest".into(),
            from_address: None,
            scheduled: Utc::now() - Duration::minutes(1),
        }
        .into_email();
        f.db.insert_email_if_absent(&email).await.unwrap();

        f.dispatcher.run_due(Utc::now()).await.unwrap();
        assert_eq!(f.transport.sent()[0].to, vec!["member@example.com"]);
    }
}
