//! Email materialization. At most one stored email per event.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, Error};
use crate::model::{
    CONTEXT_FROM_ADDRESS, CONTEXT_SCHEDULED, CONTEXT_SUBJECT, Email, EmailDraft, EntityId, Event,
};
use crate::resolver::RecipientResolver;
use crate::store::{EmailStore, EventStore};

/// What happened to one event during conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionOutcome {
    Created(Email),
    NoRecipients,
    AlreadyMaterialized,
}

/// Summary of one conversion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionReport {
    pub examined: usize,
    pub created: usize,
    pub no_recipients: usize,
    pub already_materialized: usize,
    pub failed: usize,
}

/// Turns events into stored emails.
pub struct EmailMaterializer {
    resolver: RecipientResolver,
    events: Arc<dyn EventStore>,
    emails: Arc<dyn EmailStore>,
}

impl EmailMaterializer {
    pub fn new(
        resolver: RecipientResolver,
        events: Arc<dyn EventStore>,
        emails: Arc<dyn EmailStore>,
    ) -> Self {
        Self {
            resolver,
            events,
            emails,
        }
    }

    /// Store the email for `event` addressed to `recipients`.
    ///
    /// Returns `None` when there are no recipients or the event already has
    /// an email; the store's per-event uniqueness makes this safe to repeat.
    pub async fn materialize(
        &self,
        event: &Event,
        recipients: BTreeSet<EntityId>,
    ) -> Result<Option<Email>, DatabaseError> {
        if recipients.is_empty() {
            return Ok(None);
        }
        self.insert(draft_for_event(event, recipients)).await
    }

    /// Store an email whose recipients are super-entities, fanned out to
    /// their descendants of `draft.sub_entity_kind` at send time.
    pub async fn schedule_group_email(
        &self,
        draft: EmailDraft,
    ) -> Result<Option<Email>, DatabaseError> {
        if draft.recipients.is_empty() {
            return Ok(None);
        }
        self.insert(draft).await
    }

    async fn insert(&self, draft: EmailDraft) -> Result<Option<Email>, DatabaseError> {
        let email = draft.into_email();
        if self.emails.insert_email_if_absent(&email).await? {
            debug!(
                email_id = %email.id,
                event_id = %email.event_id,
                scheduled = %email.scheduled,
                "Email materialized"
            );
            Ok(Some(email))
        } else {
            Ok(None)
        }
    }

    /// Resolve and materialize a single event.
    pub async fn convert_event(&self, event: &Event) -> Result<ConversionOutcome, Error> {
        if self.emails.email_for_event(event.id).await?.is_some() {
            return Ok(ConversionOutcome::AlreadyMaterialized);
        }

        let actors = self.events.actors(event.id).await?;
        let recipients = self.resolver.resolve(event, &actors).await?;
        if recipients.is_empty() {
            return Ok(ConversionOutcome::NoRecipients);
        }

        Ok(match self.materialize(event, recipients).await? {
            Some(email) => ConversionOutcome::Created(email),
            None => ConversionOutcome::AlreadyMaterialized,
        })
    }

    /// Convert every pending event, oldest first.
    ///
    /// A failing event is logged and left pending for the next run; only a
    /// failure to list the pending events fails the whole run.
    pub async fn convert_pending_events(&self) -> Result<ConversionReport, Error> {
        let pending = self.events.pending_for_conversion().await?;
        let mut report = ConversionReport {
            examined: pending.len(),
            ..Default::default()
        };

        for event in &pending {
            match self.convert_event(event).await {
                Ok(outcome) => {
                    match outcome {
                        ConversionOutcome::Created(_) => report.created += 1,
                        ConversionOutcome::NoRecipients => report.no_recipients += 1,
                        ConversionOutcome::AlreadyMaterialized => report.already_materialized += 1,
                    }
                    if let Err(e) = self.events.mark_converted(event.id, Utc::now()).await {
                        warn!(event_id = %event.id, "Failed to mark event converted: {e}");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    error!(event_id = %event.id, source = %event.source, "Event conversion failed: {e}");
                }
            }
        }

        info!(
            examined = report.examined,
            created = report.created,
            no_recipients = report.no_recipients,
            already_materialized = report.already_materialized,
            failed = report.failed,
            "Converted pending events"
        );
        Ok(report)
    }
}

/// Build the draft for an event: subject, sender and schedule come from the
/// context when present, otherwise empty subject and immediate scheduling.
fn draft_for_event(event: &Event, recipients: BTreeSet<EntityId>) -> EmailDraft {
    EmailDraft {
        event_id: event.id,
        source: event.source.clone(),
        recipients,
        sub_entity_kind: None,
        subject: event
            .context_str(CONTEXT_SUBJECT)
            .unwrap_or_default()
            .to_string(),
        from_address: event
            .context_str(CONTEXT_FROM_ADDRESS)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from),
        scheduled: scheduled_override(event).unwrap_or(event.created_at),
    }
}

fn scheduled_override(event: &Event) -> Option<DateTime<Utc>> {
    let raw = event.context_str(CONTEXT_SCHEDULED)?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            warn!(event_id = %event.id, value = raw, "Ignoring invalid scheduled override: {e}");
            None
        }
    }
}
