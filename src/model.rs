//! Domain types shared by resolution, materialization and dispatch.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Context keys ────────────────────────────────────────────────────

/// Subject line to use instead of one extracted from the rendered body.
pub const CONTEXT_SUBJECT: &str = "entity_emailer_subject";
/// Template name picked up by [`crate::render::TemplateRenderer`].
pub const CONTEXT_TEMPLATE: &str = "entity_emailer_template";
/// RFC 3339 timestamp overriding the email's scheduled time.
pub const CONTEXT_SCHEDULED: &str = "entity_emailer_scheduled";
/// Per-email sender address.
pub const CONTEXT_FROM_ADDRESS: &str = "entity_emailer_from_address";

// ── Identifiers ─────────────────────────────────────────────────────

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// A node in the organizational graph.
    EntityId
);
uuid_id!(
    /// Identity of a stored event.
    EventId
);
uuid_id!(
    /// Identity of a stored email.
    EmailId
);

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

name_type!(
    /// Type tag on entities ("user", "team"), used to scope group subscriptions.
    EntityKind
);
name_type!(
    /// Named category of events ("comment_posted").
    Source
);
name_type!(
    /// Delivery channel. Only the configured email medium is used here.
    Medium
);

// ── Graph ───────────────────────────────────────────────────────────

/// An entity as seen by this crate: identity, kind and free-form metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: Option<EntityKind>,
    pub meta: serde_json::Value,
}

impl Entity {
    /// The entity's email address, if its metadata carries a non-empty one.
    pub fn email_address(&self) -> Option<&str> {
        self.meta
            .get("email")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

// ── Subscriptions ───────────────────────────────────────────────────

/// Opt-in rule for a source and medium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub entity: EntityId,
    pub source: Source,
    pub medium: Medium,
    /// When set, covers the entity's descendants of this kind instead of the entity.
    pub sub_entity_kind: Option<EntityKind>,
    pub only_following: bool,
}

impl Subscription {
    pub fn is_group(&self) -> bool {
        self.sub_entity_kind.is_some()
    }
}

/// Opt-out override for a source and medium.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unsubscription {
    pub entity: EntityId,
    pub source: Source,
    pub medium: Medium,
}

// ── Events ──────────────────────────────────────────────────────────

/// Something that happened. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub source: Source,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(|v| v.as_str())
    }
}

// ── Emails ──────────────────────────────────────────────────────────

/// The persisted, at-most-once email for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub id: EmailId,
    pub event_id: EventId,
    pub source: Source,
    /// Stored entity references. Expanded into addresses only at send time.
    pub recipients: BTreeSet<EntityId>,
    /// When set, each recipient is a super-entity standing for its descendants of this kind.
    pub sub_entity_kind: Option<EntityKind>,
    pub subject: String,
    pub from_address: Option<String>,
    pub scheduled: DateTime<Utc>,
    pub sent: Option<DateTime<Utc>>,
    pub view_uid: Uuid,
}

impl Email {
    /// Due for dispatch at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.sent.is_none() && self.scheduled <= now
    }
}

/// An email to be created, before it gets an id and view token.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailDraft {
    pub event_id: EventId,
    pub source: Source,
    pub recipients: BTreeSet<EntityId>,
    pub sub_entity_kind: Option<EntityKind>,
    pub subject: String,
    pub from_address: Option<String>,
    pub scheduled: DateTime<Utc>,
}

impl EmailDraft {
    pub fn into_email(self) -> Email {
        Email {
            id: EmailId::new(),
            event_id: self.event_id,
            source: self.source,
            recipients: self.recipients,
            sub_entity_kind: self.sub_entity_kind,
            subject: self.subject,
            from_address: self.from_address,
            scheduled: self.scheduled,
            sent: None,
            view_uid: Uuid::new_v4(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn email_address_from_meta() {
        let entity = Entity {
            id: EntityId::new(),
            kind: None,
            meta: json!({"email": " a@example.com "}),
        };
        assert_eq!(entity.email_address(), Some("a@example.com"));
    }

    #[test]
    fn email_address_missing_or_blank() {
        let mut entity = Entity {
            id: EntityId::new(),
            kind: None,
            meta: json!({}),
        };
        assert_eq!(entity.email_address(), None);
        entity.meta = json!({"email": "   "});
        assert_eq!(entity.email_address(), None);
        entity.meta = json!({"email": 42});
        assert_eq!(entity.email_address(), None);
    }

    #[test]
    fn due_requires_unsent_and_past_schedule() {
        let now = Utc::now();
        let mut email = EmailDraft {
            event_id: EventId::new(),
            source: Source::from("s"),
            recipients: BTreeSet::new(),
            sub_entity_kind: None,
            subject: String::new(),
            from_address: None,
            scheduled: now,
        }
        .into_email();
        assert!(email.is_due(now));

        email.scheduled = now + chrono::Duration::days(1);
        assert!(!email.is_due(now));

        email.scheduled = now;
        email.sent = Some(now);
        assert!(!email.is_due(now));
    }

    #[test]
    fn ids_display_as_uuid() {
        let id = EntityId::new();
        let parsed: EntityId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
