//! Inbox forwarding
//!
//! When a remote activity addresses one of this server's collections (a
//! local actor's followers, say) and replies to or otherwise references
//! content this server owns, the members of those collections may not have
//! been reachable by the sender. The receiving server then forwards the
//! activity to them itself.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use url::Url;

use super::delivery::Deliverer;
use super::protocol::{ForwardingFilter, RecursionLimits};
use super::store::Store;
use super::transport::{DeliveryResult, Transport};
use crate::activity::{Activity, ObjectRef, Resource};
use crate::context::RequestContext;
use crate::error::Result;
use crate::metrics::INBOX_FORWARDING_TOTAL;

/// Why an activity was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The activity id was already known
    AlreadySeen,
    /// No addressed collection belongs to this server
    NoOwnedCollections,
    /// Nothing within the depth budget references local content
    NoOwnedValues,
    /// The application filtered out every candidate
    FilteredOut,
}

impl SkipReason {
    fn label(&self) -> &'static str {
        match self {
            SkipReason::AlreadySeen => "already_seen",
            SkipReason::NoOwnedCollections => "no_owned_collections",
            SkipReason::NoOwnedValues => "no_owned_values",
            SkipReason::FilteredOut => "filtered_out",
        }
    }
}

#[derive(Debug)]
pub enum ForwardingOutcome {
    Skipped(SkipReason),
    Forwarded {
        /// Collections whose members received the activity
        collections: Vec<Url>,
        results: Vec<DeliveryResult>,
    },
}

/// Decides on and performs inbox forwarding
pub struct InboxForwarder {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    filter: Arc<dyn ForwardingFilter>,
    limits: Arc<dyn RecursionLimits>,
    deliverer: Arc<Deliverer>,
    fetch_concurrency: usize,
}

impl InboxForwarder {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        filter: Arc<dyn ForwardingFilter>,
        limits: Arc<dyn RecursionLimits>,
        deliverer: Arc<Deliverer>,
        fetch_concurrency: usize,
    ) -> Self {
        Self {
            store,
            transport,
            filter,
            limits,
            deliverer,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    /// Forward `activity`, received at `inbox`, if the rules require it
    ///
    /// # Errors
    /// Store failures, errors from the application's filter, and failures
    /// resolving the forwarding targets.
    pub async fn forward_if_required(
        &self,
        ctx: &RequestContext,
        inbox: &Url,
        activity: &Activity,
    ) -> Result<ForwardingOutcome> {
        let outcome = self.decide_and_forward(ctx, inbox, activity).await?;

        let decision = match &outcome {
            ForwardingOutcome::Skipped(reason) => reason.label(),
            ForwardingOutcome::Forwarded { .. } => "forwarded",
        };
        INBOX_FORWARDING_TOTAL.with_label_values(&[decision]).inc();
        tracing::debug!(activity = ?activity.id, decision, "Inbox forwarding decision");

        Ok(outcome)
    }

    async fn decide_and_forward(
        &self,
        ctx: &RequestContext,
        inbox: &Url,
        activity: &Activity,
    ) -> Result<ForwardingOutcome> {
        let id = activity.require_id()?;
        if self.store.exists(ctx, id).await? {
            return Ok(ForwardingOutcome::Skipped(SkipReason::AlreadySeen));
        }
        self.store.create(ctx, activity).await?;

        let candidates = self.owned_collections(ctx, activity).await?;
        if candidates.is_empty() {
            return Ok(ForwardingOutcome::Skipped(SkipReason::NoOwnedCollections));
        }

        let depth = self.limits.max_inbox_forwarding_recursion_depth(ctx);
        if !self.references_owned_content(ctx, activity, depth).await? {
            return Ok(ForwardingOutcome::Skipped(SkipReason::NoOwnedValues));
        }

        let collections = ctx
            .run(self.filter.filter_forwarding(ctx, candidates, activity))
            .await?;
        if collections.is_empty() {
            return Ok(ForwardingOutcome::Skipped(SkipReason::FilteredOut));
        }

        let mut members = Vec::new();
        for collection in &collections {
            if let Some(items) = self.store.collection_items(ctx, collection).await? {
                members.extend(items);
            }
        }

        let mut exclude = self.deliverer.resolver().sender_inboxes(ctx, activity).await?;
        exclude.push(inbox.clone());
        let targets = self
            .deliverer
            .resolver()
            .resolve_recipients(ctx, members, Vec::new(), &exclude)
            .await?;

        tracing::info!(
            activity = %id,
            collections = collections.len(),
            inboxes = targets.visible.len(),
            "Forwarding activity to local collections"
        );
        let results = self.deliverer.send(ctx, activity, &targets).await?;

        Ok(ForwardingOutcome::Forwarded {
            collections,
            results,
        })
    }

    /// `to`, `cc` and `audience` values that are collections this server keeps
    async fn owned_collections(&self, ctx: &RequestContext, activity: &Activity) -> Result<Vec<Url>> {
        let mut seen = HashSet::new();
        let mut owned = Vec::new();
        for iri in activity.visible_recipients() {
            if !seen.insert(iri.clone()) || !self.store.owns(ctx, &iri).await? {
                continue;
            }
            if self.store.collection_items(ctx, &iri).await?.is_some() {
                owned.push(iri);
            }
        }
        Ok(owned)
    }

    /// Whether any `inReplyTo`, `object`, `target` or `tag` value, followed
    /// through referenced objects up to `depth` levels, is owned here.
    ///
    /// Level 1 is the activity's own values. A non-positive `depth` is
    /// unbounded; the visited set ends cycles.
    async fn references_owned_content(
        &self,
        ctx: &RequestContext,
        activity: &Activity,
        depth: i32,
    ) -> Result<bool> {
        let unbounded = depth <= 0;
        let mut visited: HashSet<Url> = activity.id.iter().cloned().collect();
        let mut wave: Vec<ObjectRef> = activity.forwarding_values().cloned().collect();
        let mut level: i32 = 1;

        while !wave.is_empty() {
            for value in &wave {
                if let Some(id) = value.id() {
                    if self.store.owns(ctx, id).await? {
                        return Ok(true);
                    }
                }
            }
            if !unbounded && level >= depth {
                break;
            }

            let mut embedded = Vec::new();
            let mut remote = Vec::new();
            for value in wave {
                match value {
                    ObjectRef::Embedded(object) => {
                        let fresh = match &object.id {
                            Some(id) => visited.insert(id.clone()),
                            None => true,
                        };
                        if fresh {
                            embedded.push(*object);
                        }
                    }
                    ObjectRef::Iri(iri) => {
                        if visited.insert(iri.clone()) {
                            remote.push(iri);
                        }
                    }
                }
            }

            let fetched: Vec<(Url, Result<Resource>)> = ctx
                .run(async {
                    Ok(stream::iter(remote)
                        .map(|iri| async move {
                            let resource = self.transport.dereference(ctx, &iri).await;
                            (iri, resource)
                        })
                        .buffer_unordered(self.fetch_concurrency)
                        .collect()
                        .await)
                })
                .await?;

            // An unreachable reference is skipped; the others may still
            // lead back here.
            for (iri, resource) in fetched {
                match resource {
                    Ok(Resource::Object(object)) => embedded.push(object),
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(iri = %iri, %error, "Skipping unreachable reference");
                    }
                }
            }

            wave = embedded
                .iter()
                .flat_map(|object| object.forwarding_values().cloned())
                .collect();
            level = level.saturating_add(1);
        }

        Ok(false)
    }
}
