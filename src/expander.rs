//! Send-time expansion of stored recipients into email addresses.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::error::{DatabaseError, ResolutionError};
use crate::model::{Email, EntityId};
use crate::resolver::RecipientResolver;
use crate::transport::parse_mailbox;

/// Turns an email's stored recipients into concrete addresses.
///
/// Group emails fan out against the graph as it is *now*, and
/// unsubscriptions recorded since the email was created still apply.
#[derive(Clone)]
pub struct AddressExpander {
    resolver: RecipientResolver,
}

impl AddressExpander {
    pub fn new(resolver: RecipientResolver) -> Self {
        Self { resolver }
    }

    /// Sorted, deduplicated addresses for `email`. Entities without a
    /// usable address are skipped; an empty result means there is nobody
    /// to send to.
    pub async fn expand(&self, email: &Email) -> Result<Vec<String>, ResolutionError> {
        self.expand_inner(email)
            .await
            .map_err(|source| ResolutionError::Addresses {
                email_id: email.id,
                source,
            })
    }

    async fn expand_inner(&self, email: &Email) -> Result<Vec<String>, DatabaseError> {
        let mut targets: BTreeSet<EntityId> = BTreeSet::new();
        for &recipient in &email.recipients {
            targets.extend(
                self.resolver
                    .fan_out(recipient, email.sub_entity_kind.as_ref())
                    .await?,
            );
        }
        let targets = self
            .resolver
            .without_unsubscribed(targets, &email.source)
            .await?;

        let mut addresses = BTreeSet::new();
        for id in targets {
            match self.resolver.graph().entity(id).await? {
                Some(entity) => match entity.email_address() {
                    Some(address) => match parse_mailbox(address) {
                        Ok(_) => {
                            addresses.insert(address.to_string());
                        }
                        Err(e) => warn!(email_id = %email.id, entity_id = %id, "Dropping recipient: {e}"),
                    },
                    None => debug!(entity_id = %id, "Entity has no email address"),
                },
                None => warn!(email_id = %email.id, entity_id = %id, "Recipient entity no longer exists"),
            }
        }
        Ok(addresses.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::config::EmailerConfig;
    use crate::model::{EmailDraft, EntityKind, Medium, Source, Unsubscription};
    use crate::store::LibSqlBackend;

    struct Fixture {
        db: Arc<LibSqlBackend>,
        expander: AddressExpander,
        source: Source,
        medium: Medium,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = EmailerConfig::default();
        let resolver = RecipientResolver::new(&config, db.clone(), db.clone());
        Fixture {
            expander: AddressExpander::new(resolver),
            db,
            source: Source::from("test_source"),
            medium: config.medium(),
        }
    }

    impl Fixture {
        async fn entity(&self, kind: Option<&str>, email: Option<&str>) -> EntityId {
            let kind = kind.map(EntityKind::from);
            let meta = match email {
                Some(address) => json!({ "email": address }),
                None => json!({}),
            };
            self.db.add_entity(kind.as_ref(), meta).await.unwrap().id
        }

        fn email(&self, recipients: &[EntityId], kind: Option<&str>) -> Email {
            EmailDraft {
                event_id: crate::model::EventId::new(),
                source: self.source.clone(),
                recipients: recipients.iter().copied().collect(),
                sub_entity_kind: kind.map(EntityKind::from),
                subject: String::new(),
                from_address: None,
                scheduled: Utc::now(),
            }
            .into_email()
        }

        async fn unsubscribe(&self, entity: EntityId) {
            self.db
                .add_unsubscription(&Unsubscription {
                    entity,
                    source: self.source.clone(),
                    medium: self.medium.clone(),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn individual_recipients() {
        let f = fixture().await;
        let a = f.entity(None, Some("test1@example.com")).await;
        let b = f.entity(None, Some("test2@example.com")).await;

        let addresses = f.expander.expand(&f.email(&[a, b], None)).await.unwrap();
        assert_eq!(addresses, vec!["test1@example.com", "test2@example.com"]);
    }

    #[tokio::test]
    async fn individual_recipient_unsubscribed() {
        let f = fixture().await;
        let a = f.entity(None, Some("test1@example.com")).await;
        let b = f.entity(None, Some("test2@example.com")).await;
        f.unsubscribe(a).await;

        let addresses = f.expander.expand(&f.email(&[a, b], None)).await.unwrap();
        assert_eq!(addresses, vec!["test2@example.com"]);
    }

    #[tokio::test]
    async fn group_recipients_fan_out_by_kind() {
        let f = fixture().await;
        let se = f.entity(None, Some("group@example.com")).await;
        let a = f.entity(Some("user"), Some("test1@example.com")).await;
        let b = f.entity(Some("user"), Some("test2@example.com")).await;
        let team = f.entity(Some("team"), Some("team@example.com")).await;
        for sub in [a, b, team] {
            f.db.add_relationship(se, sub).await.unwrap();
        }

        let addresses = f.expander.expand(&f.email(&[se], Some("user"))).await.unwrap();
        assert_eq!(addresses, vec!["test1@example.com", "test2@example.com"]);
    }

    #[tokio::test]
    async fn group_recipient_unsubscribed_after_creation() {
        let f = fixture().await;
        let se = f.entity(None, None).await;
        let a = f.entity(Some("user"), Some("test1@example.com")).await;
        let b = f.entity(Some("user"), Some("test2@example.com")).await;
        f.db.add_relationship(se, a).await.unwrap();
        f.db.add_relationship(se, b).await.unwrap();
        let email = f.email(&[se], Some("user"));

        f.unsubscribe(b).await;

        let addresses = f.expander.expand(&email).await.unwrap();
        assert_eq!(addresses, vec!["test1@example.com"]);
    }

    #[tokio::test]
    async fn membership_is_read_at_expansion_time() {
        let f = fixture().await;
        let se = f.entity(None, None).await;
        let a = f.entity(Some("user"), Some("test1@example.com")).await;
        f.db.add_relationship(se, a).await.unwrap();
        let email = f.email(&[se], Some("user"));

        let late = f.entity(Some("user"), Some("late@example.com")).await;
        f.db.add_relationship(se, late).await.unwrap();
        f.db.remove_relationship(se, a).await.unwrap();

        let addresses = f.expander.expand(&email).await.unwrap();
        assert_eq!(addresses, vec!["late@example.com"]);
    }

    #[tokio::test]
    async fn overlapping_groups_and_missing_addresses() {
        let f = fixture().await;
        let g1 = f.entity(None, None).await;
        let g2 = f.entity(None, None).await;
        let shared = f.entity(Some("user"), Some("shared@example.com")).await;
        let silent = f.entity(Some("user"), None).await;
        for (sup, sub) in [(g1, shared), (g2, shared), (g2, silent)] {
            f.db.add_relationship(sup, sub).await.unwrap();
        }

        let addresses = f
            .expander
            .expand(&f.email(&[g1, g2], Some("user")))
            .await
            .unwrap();
        assert_eq!(addresses, vec!["shared@example.com"]);
    }

    #[tokio::test]
    async fn malformed_address_is_dropped() {
        let f = fixture().await;
        let good = f.entity(None, Some("good@example.com")).await;
        let bad = f.entity(None, Some("not an address")).await;

        let addresses = f.expander.expand(&f.email(&[good, bad], None)).await.unwrap();
        assert_eq!(addresses, vec!["good@example.com"]);
    }

    #[tokio::test]
    async fn address_is_read_at_expansion_time() {
        let f = fixture().await;
        let a = f.entity(None, Some("old@example.com")).await;
        let email = f.email(&[a], None);

        f.db
            .update_entity_meta(a, &json!({"email": "new@example.com"}))
            .await
            .unwrap();

        let addresses = f.expander.expand(&email).await.unwrap();
        assert_eq!(addresses, vec!["new@example.com"]);
    }

    #[tokio::test]
    async fn unknown_recipient_is_skipped() {
        let f = fixture().await;
        let a = f.entity(None, Some("test1@example.com")).await;
        let addresses = f
            .expander
            .expand(&f.email(&[a, EntityId::new()], None))
            .await
            .unwrap();
        assert_eq!(addresses, vec!["test1@example.com"]);
    }
}
