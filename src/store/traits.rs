//! Collaborator seams consumed by resolution and dispatch.
//!
//! The entity graph, the subscription tables and the event log are owned by
//! other parts of the system; only the email table is written here. One
//! backend may implement all four traits (see [`super::LibSqlBackend`]).

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::model::{
    Email, EmailId, Entity, EntityId, EntityKind, Event, EventId, Medium, Source, Subscription,
};

/// Read-only view of the organizational graph.
#[async_trait]
pub trait EntityGraph: Send + Sync {
    /// All ancestors of `entity`, transitively. Never includes `entity` itself.
    async fn super_entities(&self, entity: EntityId) -> Result<BTreeSet<EntityId>, DatabaseError>;

    /// All descendants of `entity` (transitively) whose kind is `kind`.
    async fn descendants_of_kind(
        &self,
        entity: EntityId,
        kind: &EntityKind,
    ) -> Result<BTreeSet<EntityId>, DatabaseError>;

    /// Entity metadata, `None` if the entity is unknown.
    async fn entity(&self, entity: EntityId) -> Result<Option<Entity>, DatabaseError>;
}

/// Read-only view of subscription preferences.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn subscriptions_for(
        &self,
        source: &Source,
        medium: &Medium,
    ) -> Result<Vec<Subscription>, DatabaseError>;

    async fn is_unsubscribed(
        &self,
        entity: EntityId,
        source: &Source,
        medium: &Medium,
    ) -> Result<bool, DatabaseError>;
}

/// The event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn get_event(&self, id: EventId) -> Result<Option<Event>, DatabaseError>;

    async fn actors(&self, event: EventId) -> Result<BTreeSet<EntityId>, DatabaseError>;

    /// Events not yet converted, oldest first.
    async fn pending_for_conversion(&self) -> Result<Vec<Event>, DatabaseError>;

    /// Record that `event` has been through conversion so it is not listed again.
    async fn mark_converted(&self, event: EventId, at: DateTime<Utc>)
    -> Result<(), DatabaseError>;
}

/// Persistence for emails.
#[async_trait]
pub trait EmailStore: Send + Sync {
    /// Insert `email` unless one already exists for its event.
    ///
    /// Returns `false` when an email for the event was already present.
    /// Atomic per event: concurrent callers cannot both get `true`.
    async fn insert_email_if_absent(&self, email: &Email) -> Result<bool, DatabaseError>;

    async fn get_email(&self, id: EmailId) -> Result<Option<Email>, DatabaseError>;

    async fn email_for_event(&self, event: EventId) -> Result<Option<Email>, DatabaseError>;

    /// Unsent emails whose scheduled time is at or before `now`.
    async fn due_unsent_emails(&self, now: DateTime<Utc>) -> Result<Vec<Email>, DatabaseError>;

    /// Set `sent` if it is still null. Returns `false` if it was already set.
    async fn mark_sent(&self, id: EmailId, at: DateTime<Utc>) -> Result<bool, DatabaseError>;
}
