//! libSQL backend implementing every store trait over one connection.
//!
//! Supports local file and in-memory databases. Besides the read-side
//! traits it exposes the write helpers used to seed the graph, the
//! subscription tables and the event log.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    Email, EmailId, Entity, EntityId, EntityKind, Event, EventId, Medium, Source, Subscription,
    Unsubscription,
};
use crate::store::migrations;
use crate::store::traits::{EmailStore, EntityGraph, EventStore, SubscriptionStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Write helpers for externally-owned tables ───────────────────

    /// Insert an entity with the given kind and metadata.
    pub async fn add_entity(
        &self,
        kind: Option<&EntityKind>,
        meta: serde_json::Value,
    ) -> Result<Entity, DatabaseError> {
        let entity = Entity {
            id: EntityId::new(),
            kind: kind.cloned(),
            meta,
        };
        self.conn()
            .execute(
                "INSERT INTO entities (id, kind, meta) VALUES (?1, ?2, ?3)",
                params![
                    entity.id.to_string(),
                    opt_text(entity.kind.as_ref().map(EntityKind::as_str)),
                    entity.meta.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_entity: {e}")))?;

        debug!(entity_id = %entity.id, "Entity inserted into DB");
        Ok(entity)
    }

    /// Replace an entity's metadata.
    pub async fn update_entity_meta(
        &self,
        entity: EntityId,
        meta: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE entities SET meta = ?1 WHERE id = ?2",
                params![meta.to_string(), entity.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_entity_meta: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "entity".into(),
                id: entity.to_string(),
            });
        }
        Ok(())
    }

    /// Record that `sub` belongs to `super_entity`.
    pub async fn add_relationship(
        &self,
        super_entity: EntityId,
        sub: EntityId,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO entity_relationships (super_entity_id, sub_entity_id)
                 VALUES (?1, ?2)",
                params![super_entity.to_string(), sub.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_relationship: {e}")))?;
        Ok(())
    }

    pub async fn remove_relationship(
        &self,
        super_entity: EntityId,
        sub: EntityId,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM entity_relationships WHERE super_entity_id = ?1 AND sub_entity_id = ?2",
                params![super_entity.to_string(), sub.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_relationship: {e}")))?;
        Ok(())
    }

    pub async fn add_subscription(&self, sub: &Subscription) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO subscriptions (id, entity_id, source, medium, sub_entity_kind, only_following)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    sub.entity.to_string(),
                    sub.source.as_str(),
                    sub.medium.as_str(),
                    opt_text(sub.sub_entity_kind.as_ref().map(EntityKind::as_str)),
                    sub.only_following as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_subscription: {e}")))?;
        Ok(())
    }

    pub async fn add_unsubscription(&self, unsub: &Unsubscription) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO unsubscriptions (entity_id, source, medium) VALUES (?1, ?2, ?3)",
                params![
                    unsub.entity.to_string(),
                    unsub.source.as_str(),
                    unsub.medium.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_unsubscription: {e}")))?;
        Ok(())
    }

    /// Append an event with its actors.
    pub async fn add_event(
        &self,
        source: &Source,
        context: serde_json::Value,
        created_at: DateTime<Utc>,
        actors: &[EntityId],
    ) -> Result<Event, DatabaseError> {
        let event = Event {
            id: EventId::new(),
            source: source.clone(),
            context,
            created_at,
        };

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("add_event begin: {e}")))?;
        tx.execute(
            "INSERT INTO events (id, source, context, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.id.to_string(),
                event.source.as_str(),
                event.context.to_string(),
                fmt_datetime(&event.created_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("add_event: {e}")))?;
        for actor in actors {
            tx.execute(
                "INSERT OR IGNORE INTO event_actors (event_id, entity_id) VALUES (?1, ?2)",
                params![event.id.to_string(), actor.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_event actor: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("add_event commit: {e}")))?;

        debug!(event_id = %event.id, source = %event.source, actors = actors.len(), "Event inserted into DB");
        Ok(event)
    }

    async fn collect_ids(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<BTreeSet<EntityId>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut ids = BTreeSet::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            let raw: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
            ids.insert(parse_id(&raw)?);
        }
        Ok(ids)
    }

    async fn recipients_of(&self, email: EmailId) -> Result<BTreeSet<EntityId>, DatabaseError> {
        self.collect_ids(
            "recipients_of",
            "SELECT entity_id FROM email_recipients WHERE email_id = ?1",
            params![email.to_string()],
        )
        .await
    }

    async fn query_emails(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Email>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut emails = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            emails.push(row_to_email(&row)?);
        }
        for email in &mut emails {
            email.recipients = self.recipients_of(email.id).await?;
        }
        Ok(emails)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed width so text comparison orders correctly.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    warn!(value = s, "Unparseable datetime in database, treating as earliest time");
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_id<T: std::str::FromStr<Err = uuid::Error>>(raw: &str) -> Result<T, DatabaseError> {
    raw.parse()
        .map_err(|e| DatabaseError::Serialization(format!("invalid id '{raw}': {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const EVENT_COLUMNS: &str = "id, source, context, created_at";

const EMAIL_COLUMNS: &str =
    "id, event_id, source, sub_entity_kind, subject, from_address, scheduled, sent, view_uid";

/// Map a libsql Row to an Event. Column order matches EVENT_COLUMNS.
fn row_to_event(row: &libsql::Row) -> Result<Event, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("event row parse: {e}"));
    let id: String = row.get(0).map_err(parse)?;
    let source: String = row.get(1).map_err(parse)?;
    let context: String = row.get(2).map_err(parse)?;
    let created_at: String = row.get(3).map_err(parse)?;

    Ok(Event {
        id: parse_id(&id)?,
        source: Source(source),
        context: serde_json::from_str(&context)
            .map_err(|e| DatabaseError::Serialization(format!("event {id} context: {e}")))?,
        created_at: parse_datetime(&created_at),
    })
}

/// Map a libsql Row to an Email without recipients. Column order matches EMAIL_COLUMNS.
fn row_to_email(row: &libsql::Row) -> Result<Email, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("email row parse: {e}"));
    let id: String = row.get(0).map_err(parse)?;
    let event_id: String = row.get(1).map_err(parse)?;
    let source: String = row.get(2).map_err(parse)?;
    let sub_entity_kind: Option<String> = row.get(3).ok();
    let subject: String = row.get(4).map_err(parse)?;
    let from_address: Option<String> = row.get(5).ok();
    let scheduled: String = row.get(6).map_err(parse)?;
    let sent: Option<String> = row.get(7).ok();
    let view_uid: String = row.get(8).map_err(parse)?;

    Ok(Email {
        id: parse_id(&id)?,
        event_id: parse_id(&event_id)?,
        source: Source(source),
        recipients: BTreeSet::new(),
        sub_entity_kind: sub_entity_kind.map(EntityKind),
        subject,
        from_address,
        scheduled: parse_datetime(&scheduled),
        sent: parse_optional_datetime(&sent),
        view_uid: Uuid::parse_str(&view_uid)
            .map_err(|e| DatabaseError::Serialization(format!("email {id} view_uid: {e}")))?,
    })
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl EntityGraph for LibSqlBackend {
    async fn super_entities(&self, entity: EntityId) -> Result<BTreeSet<EntityId>, DatabaseError> {
        self.collect_ids(
            "super_entities",
            "WITH RECURSIVE ancestors(id) AS (
                SELECT super_entity_id FROM entity_relationships WHERE sub_entity_id = ?1
                UNION
                SELECT r.super_entity_id FROM entity_relationships r
                    JOIN ancestors a ON r.sub_entity_id = a.id
            )
            SELECT id FROM ancestors WHERE id != ?1",
            params![entity.to_string()],
        )
        .await
    }

    async fn descendants_of_kind(
        &self,
        entity: EntityId,
        kind: &EntityKind,
    ) -> Result<BTreeSet<EntityId>, DatabaseError> {
        self.collect_ids(
            "descendants_of_kind",
            "WITH RECURSIVE descendants(id) AS (
                SELECT sub_entity_id FROM entity_relationships WHERE super_entity_id = ?1
                UNION
                SELECT r.sub_entity_id FROM entity_relationships r
                    JOIN descendants d ON r.super_entity_id = d.id
            )
            SELECT e.id FROM entities e JOIN descendants d ON e.id = d.id
            WHERE e.kind = ?2 AND e.id != ?1",
            params![entity.to_string(), kind.as_str()],
        )
        .await
    }

    async fn entity(&self, entity: EntityId) -> Result<Option<Entity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, kind, meta FROM entities WHERE id = ?1",
                params![entity.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("entity: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let kind: Option<String> = row.get(1).ok();
                let meta: String = row
                    .get(2)
                    .map_err(|e| DatabaseError::Query(format!("entity row parse: {e}")))?;
                Ok(Some(Entity {
                    id: entity,
                    kind: kind.map(EntityKind),
                    meta: serde_json::from_str(&meta).map_err(|e| {
                        DatabaseError::Serialization(format!("entity {entity} meta: {e}"))
                    })?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("entity: {e}"))),
        }
    }
}

#[async_trait]
impl SubscriptionStore for LibSqlBackend {
    async fn subscriptions_for(
        &self,
        source: &Source,
        medium: &Medium,
    ) -> Result<Vec<Subscription>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT entity_id, sub_entity_kind, only_following FROM subscriptions
                 WHERE source = ?1 AND medium = ?2 ORDER BY created_at ASC",
                params![source.as_str(), medium.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("subscriptions_for: {e}")))?;

        let mut subs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("subscriptions_for: {e}")))?
        {
            let entity: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("subscription row parse: {e}")))?;
            let sub_entity_kind: Option<String> = row.get(1).ok();
            let only_following: i64 = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("subscription row parse: {e}")))?;
            subs.push(Subscription {
                entity: parse_id(&entity)?,
                source: source.clone(),
                medium: medium.clone(),
                sub_entity_kind: sub_entity_kind.map(EntityKind),
                only_following: only_following != 0,
            });
        }
        Ok(subs)
    }

    async fn is_unsubscribed(
        &self,
        entity: EntityId,
        source: &Source,
        medium: &Medium,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM unsubscriptions WHERE entity_id = ?1 AND source = ?2 AND medium = ?3",
                params![entity.to_string(), source.as_str(), medium.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_unsubscribed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("is_unsubscribed row parse: {e}")))?;
                Ok(count > 0)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("is_unsubscribed: {e}"))),
        }
    }
}

#[async_trait]
impl EventStore for LibSqlBackend {
    async fn get_event(&self, id: EventId) -> Result<Option<Event>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_event: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_event(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_event: {e}"))),
        }
    }

    async fn actors(&self, event: EventId) -> Result<BTreeSet<EntityId>, DatabaseError> {
        self.collect_ids(
            "actors",
            "SELECT entity_id FROM event_actors WHERE event_id = ?1",
            params![event.to_string()],
        )
        .await
    }

    async fn pending_for_conversion(&self) -> Result<Vec<Event>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE converted_at IS NULL
                       AND id NOT IN (SELECT event_id FROM emails)
                     ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_for_conversion: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_for_conversion: {e}")))?
        {
            match row_to_event(&row) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!("Skipping event row: {e}");
                }
            }
        }
        Ok(events)
    }

    async fn mark_converted(
        &self,
        event: EventId,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE events SET converted_at = ?1 WHERE id = ?2 AND converted_at IS NULL",
                params![fmt_datetime(&at), event.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_converted: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl EmailStore for LibSqlBackend {
    async fn insert_email_if_absent(&self, email: &Email) -> Result<bool, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_email begin: {e}")))?;

        let inserted = tx
            .execute(
                "INSERT INTO emails (id, event_id, source, sub_entity_kind, subject, from_address, scheduled, sent, view_uid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(event_id) DO NOTHING",
                params![
                    email.id.to_string(),
                    email.event_id.to_string(),
                    email.source.as_str(),
                    opt_text(email.sub_entity_kind.as_ref().map(EntityKind::as_str)),
                    email.subject.as_str(),
                    opt_text(email.from_address.as_deref()),
                    fmt_datetime(&email.scheduled),
                    opt_text(email.sent.map(|s| fmt_datetime(&s)).as_deref()),
                    email.view_uid.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_email: {e}")))?;

        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("insert_email rollback: {e}")))?;
            debug!(event_id = %email.event_id, "Email already exists for event");
            return Ok(false);
        }

        for recipient in &email.recipients {
            tx.execute(
                "INSERT OR IGNORE INTO email_recipients (email_id, entity_id) VALUES (?1, ?2)",
                params![email.id.to_string(), recipient.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_email recipient: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_email commit: {e}")))?;

        debug!(
            email_id = %email.id,
            event_id = %email.event_id,
            recipients = email.recipients.len(),
            "Email inserted into DB"
        );
        Ok(true)
    }

    async fn get_email(&self, id: EmailId) -> Result<Option<Email>, DatabaseError> {
        let mut emails = self
            .query_emails(
                "get_email",
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(emails.pop())
    }

    async fn email_for_event(&self, event: EventId) -> Result<Option<Email>, DatabaseError> {
        let mut emails = self
            .query_emails(
                "email_for_event",
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE event_id = ?1"),
                params![event.to_string()],
            )
            .await?;
        Ok(emails.pop())
    }

    async fn due_unsent_emails(&self, now: DateTime<Utc>) -> Result<Vec<Email>, DatabaseError> {
        self.query_emails(
            "due_unsent_emails",
            &format!(
                "SELECT {EMAIL_COLUMNS} FROM emails
                 WHERE sent IS NULL AND scheduled <= ?1
                 ORDER BY scheduled ASC"
            ),
            params![fmt_datetime(&now)],
        )
        .await
    }

    async fn mark_sent(&self, id: EmailId, at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE emails SET sent = ?1 WHERE id = ?2 AND sent IS NULL",
                params![fmt_datetime(&at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_sent: {e}")))?;

        debug!(email_id = %id, changed, "Email marked sent");
        Ok(changed > 0)
    }
}
