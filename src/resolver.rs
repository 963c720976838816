//! Recipient resolution: which entities should get an email for an event.
//!
//! Resolution is a pure read over the graph and the subscription tables:
//! direct subscriptions contribute their entity, group subscriptions
//! contribute the subscriber's descendants of the target kind, and an
//! unsubscription removes an entity no matter how it was reached.
//!
//! The fan-out and unsubscription helpers are shared with
//! [`crate::expander::AddressExpander`], which runs them again at send time.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::config::EmailerConfig;
use crate::error::{DatabaseError, ResolutionError};
use crate::model::{EntityId, EntityKind, Event, Medium, Source, Subscription};
use crate::store::{EntityGraph, SubscriptionStore};

/// Computes the deduplicated recipient set of an event.
#[derive(Clone)]
pub struct RecipientResolver {
    graph: Arc<dyn EntityGraph>,
    subscriptions: Arc<dyn SubscriptionStore>,
    medium: Medium,
}

impl RecipientResolver {
    pub fn new(
        config: &EmailerConfig,
        graph: Arc<dyn EntityGraph>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            graph,
            subscriptions,
            medium: config.medium(),
        }
    }

    pub fn medium(&self) -> &Medium {
        &self.medium
    }

    pub(crate) fn graph(&self) -> &Arc<dyn EntityGraph> {
        &self.graph
    }

    /// Resolve the recipients of `event`, given its actor set.
    ///
    /// An empty result means the event gets no email.
    pub async fn resolve(
        &self,
        event: &Event,
        actors: &BTreeSet<EntityId>,
    ) -> Result<BTreeSet<EntityId>, ResolutionError> {
        let subscriptions = self
            .subscriptions
            .subscriptions_for(&event.source, &self.medium)
            .await
            .map_err(|source| ResolutionError::Subscriptions {
                event_id: event.id,
                source,
            })?;

        let (direct, group): (Vec<&Subscription>, Vec<&Subscription>) =
            subscriptions.iter().partition(|s| !s.is_group());

        let graph_err = |source| ResolutionError::Graph {
            event_id: event.id,
            source,
        };

        let mut candidates = BTreeSet::new();

        for sub in direct {
            if !sub.only_following || self.is_following(sub.entity, actors).await.map_err(graph_err)? {
                candidates.insert(sub.entity);
            }
        }

        for sub in group {
            // Following is decided at the group level: the super-entity must be an actor.
            if sub.only_following && !actors.contains(&sub.entity) {
                continue;
            }
            let members = self
                .fan_out(sub.entity, sub.sub_entity_kind.as_ref())
                .await
                .map_err(graph_err)?;
            candidates.extend(members);
        }

        let recipients = self
            .without_unsubscribed(candidates, &event.source)
            .await
            .map_err(|source| ResolutionError::Subscriptions {
                event_id: event.id,
                source,
            })?;

        debug!(
            event_id = %event.id,
            subscriptions = subscriptions.len(),
            recipients = recipients.len(),
            "Resolved event recipients"
        );
        Ok(recipients)
    }

    /// Whether `entity` follows an event with `actors`: it is an actor
    /// itself, or one of its super-entities is.
    async fn is_following(
        &self,
        entity: EntityId,
        actors: &BTreeSet<EntityId>,
    ) -> Result<bool, DatabaseError> {
        if actors.contains(&entity) {
            return Ok(true);
        }
        if actors.is_empty() {
            return Ok(false);
        }
        let ancestors = self.graph.super_entities(entity).await?;
        Ok(!ancestors.is_disjoint(actors))
    }

    /// Targets a subscription root stands for: its descendants of `kind`
    /// for a group, otherwise the root itself.
    pub(crate) async fn fan_out(
        &self,
        root: EntityId,
        kind: Option<&EntityKind>,
    ) -> Result<BTreeSet<EntityId>, DatabaseError> {
        match kind {
            Some(kind) => self.graph.descendants_of_kind(root, kind).await,
            None => Ok(BTreeSet::from([root])),
        }
    }

    /// Drop every candidate with an unsubscription for `source` on this medium.
    pub(crate) async fn without_unsubscribed(
        &self,
        candidates: BTreeSet<EntityId>,
        source: &Source,
    ) -> Result<BTreeSet<EntityId>, DatabaseError> {
        let mut kept = BTreeSet::new();
        for entity in candidates {
            if self
                .subscriptions
                .is_unsubscribed(entity, source, &self.medium)
                .await?
            {
                debug!(entity_id = %entity, source = %source, "Skipping unsubscribed entity");
                continue;
            }
            kept.insert(entity);
        }
        Ok(kept)
    }
}
