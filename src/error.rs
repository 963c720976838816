//! Error types for the entity emailer.

use std::path::PathBuf;

use crate::model::{EmailId, EventId};

/// Top-level error type for a job invocation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

impl Error {
    /// Whether the scheduler should try this job again on its next tick.
    ///
    /// Configuration problems need an operator; everything else is transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Config(_))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failure while computing the recipients of one event.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("Entity graph lookup failed for event {event_id}: {source}")]
    Graph {
        event_id: EventId,
        #[source]
        source: DatabaseError,
    },

    #[error("Subscription lookup failed for event {event_id}: {source}")]
    Subscriptions {
        event_id: EventId,
        #[source]
        source: DatabaseError,
    },

    #[error("Address lookup failed for email {email_id}: {source}")]
    Addresses {
        email_id: EmailId,
        #[source]
        source: DatabaseError,
    },
}

/// Failure while rendering an event into email bodies.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to read template {path}: {source}")]
    TemplateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid template name: {0}")]
    InvalidTemplateName(String),
}

/// Transport failures. Always retryable on the next dispatch run.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Transport task panicked: {0}")]
    Join(String),
}
