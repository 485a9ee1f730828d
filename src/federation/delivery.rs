//! Delivery target resolution and outbound delivery
//!
//! Turns an activity's addressing into the set of inbox endpoints that must
//! receive it:
//!
//! 1. Split addressing into visible (`to`, `cc`, `audience`) and hidden
//!    (`bto`, `bcc`) receivers.
//! 2. Flatten collections breadth-first, one wave per depth level, with a
//!    visited set so cyclic collection graphs terminate.
//! 3. Let the application's `InboxResolver` map receivers to endpoints,
//!    then resolve whatever it left over through each actor's own inbox.
//! 4. Deduplicate, drop the sender's own inboxes, and keep the hidden list
//!    apart from the visible one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use url::Url;

use super::protocol::{InboxResolver, RecursionLimits};
use super::store::Store;
use super::transport::{DeliveryResult, Transport};
use crate::activity::{Activity, Actor, Collection, PageRef, Resource, is_public};
use crate::context::RequestContext;
use crate::error::{AppError, Result};
use crate::metrics::{COLLECTION_FETCHES_TOTAL, DELIVERY_TARGETS_RESOLVED};

/// Bounds applied to every traversal
#[derive(Debug, Clone, Copy)]
pub struct TraversalSettings {
    /// Concurrent dereferences per wave
    pub fetch_concurrency: usize,
    /// Pages read per collection
    pub max_collection_pages: usize,
}

impl Default for TraversalSettings {
    fn default() -> Self {
        Self {
            fetch_concurrency: 8,
            max_collection_pages: 64,
        }
    }
}

/// Resolved inbox endpoints, one list per audience
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryTargets {
    pub visible: Vec<Url>,
    pub hidden: Vec<Url>,
}

impl DeliveryTargets {
    /// Every endpoint once, visible first
    pub fn all(&self) -> Vec<Url> {
        unique(self.visible.iter().chain(&self.hidden).cloned(), &[])
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty() && self.hidden.is_empty()
    }
}

/// Dedupe by IRI keeping first occurrence, skipping `exclude`
fn unique(iris: impl IntoIterator<Item = Url>, exclude: &[Url]) -> Vec<Url> {
    let mut seen: HashSet<Url> = exclude.iter().cloned().collect();
    iris.into_iter().filter(|iri| seen.insert(iri.clone())).collect()
}

/// What one dereferenced receiver turned out to be
enum Expansion {
    Collection { members: Vec<Url>, pages: Vec<Url> },
    Actor(Actor),
    Other,
}

/// Actors seen during one resolution; `None` marks a known non-actor
type ActorCache = HashMap<Url, Option<Actor>>;

/// Expands addressing into inbox endpoints
pub struct DeliveryResolver {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    inbox_resolver: Arc<dyn InboxResolver>,
    limits: Arc<dyn RecursionLimits>,
    settings: TraversalSettings,
}

impl DeliveryResolver {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        inbox_resolver: Arc<dyn InboxResolver>,
        limits: Arc<dyn RecursionLimits>,
        settings: TraversalSettings,
    ) -> Self {
        Self {
            store,
            transport,
            inbox_resolver,
            limits,
            settings: TraversalSettings {
                fetch_concurrency: settings.fetch_concurrency.max(1),
                max_collection_pages: settings.max_collection_pages.max(1),
            },
        }
    }

    /// Resolve the endpoints `activity` must be delivered to
    ///
    /// The sending actors' own inboxes are never targets.
    pub async fn resolve(&self, ctx: &RequestContext, activity: &Activity) -> Result<DeliveryTargets> {
        let exclude = self.sender_inboxes(ctx, activity).await?;
        self.resolve_recipients(
            ctx,
            activity.visible_recipients(),
            activity.hidden_recipients(),
            &exclude,
        )
        .await
    }

    /// Resolve explicit receiver lists
    ///
    /// # Arguments
    /// * `visible` - Receivers anyone may learn about
    /// * `hidden` - Receivers that must stay undisclosed
    /// * `exclude` - Endpoints never to target
    ///
    /// # Errors
    /// Any failed dereference aborts the whole resolution; a partial target
    /// list is never returned.
    pub async fn resolve_recipients(
        &self,
        ctx: &RequestContext,
        visible: Vec<Url>,
        hidden: Vec<Url>,
        exclude: &[Url],
    ) -> Result<DeliveryTargets> {
        let depth = self.limits.max_delivery_recursion_depth(ctx);
        let mut actors = ActorCache::new();

        // Each audience gets its own traversal and visited set.
        let visible_receivers = self.expand(ctx, visible, depth, &mut actors).await?;
        let hidden_receivers = self.expand(ctx, hidden, depth, &mut actors).await?;

        let resolved = ctx
            .run(self.inbox_resolver.resolve_inbox_iris(
                ctx,
                &visible_receivers,
                &hidden_receivers,
            ))
            .await?;

        let mut visible_inboxes = resolved.visible.inboxes;
        visible_inboxes.extend(
            self.remaining_inboxes(
                ctx,
                resolved.visible.remaining,
                &visible_receivers,
                depth,
                &mut actors,
            )
            .await?,
        );
        let mut hidden_inboxes = resolved.hidden.inboxes;
        hidden_inboxes.extend(
            self.remaining_inboxes(
                ctx,
                resolved.hidden.remaining,
                &hidden_receivers,
                depth,
                &mut actors,
            )
            .await?,
        );

        let targets = DeliveryTargets {
            visible: unique(visible_inboxes, exclude),
            hidden: unique(hidden_inboxes, exclude),
        };

        DELIVERY_TARGETS_RESOLVED
            .with_label_values(&["visible"])
            .inc_by(targets.visible.len() as u64);
        DELIVERY_TARGETS_RESOLVED
            .with_label_values(&["hidden"])
            .inc_by(targets.hidden.len() as u64);
        tracing::debug!(
            depth,
            visible = targets.visible.len(),
            hidden = targets.hidden.len(),
            "Resolved delivery targets"
        );

        Ok(targets)
    }

    /// Inboxes (personal and shared) of the actors that performed `activity`
    pub async fn sender_inboxes(
        &self,
        ctx: &RequestContext,
        activity: &Activity,
    ) -> Result<Vec<Url>> {
        let mut inboxes = Vec::new();
        for actor_iri in activity.actor_iris()? {
            if let Resource::Actor(actor) = self.fetch(ctx, &actor_iri).await? {
                inboxes.extend(actor.shared_inbox().cloned());
                inboxes.push(actor.inbox);
            }
        }
        Ok(inboxes)
    }

    /// Breadth-first flattening of `roots`
    ///
    /// Roots sit at level 1. Collections at levels up to `depth` are
    /// flattened; members that would land past the budget are returned
    /// as-is. A non-positive `depth` is unbounded and relies on the visited
    /// set to terminate.
    async fn expand(
        &self,
        ctx: &RequestContext,
        roots: Vec<Url>,
        depth: i32,
        actors: &mut ActorCache,
    ) -> Result<Vec<Url>> {
        let unbounded = depth <= 0;
        let mut visited: HashSet<Url> = HashSet::new();
        let mut receivers = Vec::new();
        let mut wave = roots;
        let mut level: i32 = 1;

        while !wave.is_empty() {
            if !unbounded && level > depth {
                tracing::debug!(level, pending = wave.len(), "Delivery depth exhausted");
                receivers.extend(
                    wave.into_iter()
                        .filter(|iri| !is_public(iri) && !visited.contains(iri)),
                );
                break;
            }

            let pending: Vec<Url> = wave
                .into_iter()
                .filter(|iri| !is_public(iri) && visited.insert(iri.clone()))
                .collect();

            let fetched: Vec<(Url, Result<Expansion>)> = ctx
                .run(async {
                    Ok(stream::iter(pending)
                        .map(|iri| async move {
                            let expansion = self.classify(ctx, &iri).await;
                            (iri, expansion)
                        })
                        .buffer_unordered(self.settings.fetch_concurrency)
                        .collect()
                        .await)
                })
                .await?;

            let mut next = Vec::new();
            for (iri, expansion) in fetched {
                match expansion? {
                    Expansion::Collection { members, pages } => {
                        actors.insert(iri, None);
                        visited.extend(pages);
                        next.extend(members);
                    }
                    Expansion::Actor(actor) => {
                        receivers.push(iri.clone());
                        actors.insert(iri, Some(actor));
                    }
                    Expansion::Other => {
                        receivers.push(iri.clone());
                        actors.insert(iri, None);
                    }
                }
            }

            wave = next;
            level = level.saturating_add(1);
        }

        Ok(receivers)
    }

    async fn classify(&self, ctx: &RequestContext, iri: &Url) -> Result<Expansion> {
        if self.store.owns(ctx, iri).await? {
            if let Some(members) = self.store.collection_items(ctx, iri).await? {
                return Ok(Expansion::Collection {
                    members,
                    pages: Vec::new(),
                });
            }
        }

        match self.fetch(ctx, iri).await? {
            Resource::Collection(collection) => {
                let (members, pages) = self.collect_members(ctx, collection).await?;
                Ok(Expansion::Collection { members, pages })
            }
            Resource::Actor(actor) => Ok(Expansion::Actor(actor)),
            Resource::Object(_) => Ok(Expansion::Other),
        }
    }

    /// Members of a collection across its pages
    ///
    /// Follows `first` then `next`, stopping on a repeated page or after
    /// `max_collection_pages` pages.
    async fn collect_members(
        &self,
        ctx: &RequestContext,
        collection: Collection,
    ) -> Result<(Vec<Url>, Vec<Url>)> {
        let mut members: Vec<Url> = collection.member_iris().cloned().collect();
        let mut pages = Vec::new();
        let mut seen: HashSet<Url> = collection.id.iter().cloned().collect();
        let mut cursor = collection.first.or(collection.next);
        let mut read = 0usize;

        while let Some(link) = cursor.take() {
            if read >= self.settings.max_collection_pages {
                tracing::warn!(
                    collection = ?collection.id,
                    pages = read,
                    "Collection page limit reached; remaining pages skipped"
                );
                break;
            }
            read += 1;

            let page = match link {
                PageRef::Embedded(page) => *page,
                PageRef::Iri(iri) => {
                    if !seen.insert(iri.clone()) {
                        break;
                    }
                    pages.push(iri.clone());
                    match self.fetch(ctx, &iri).await? {
                        Resource::Collection(page) => page,
                        _ => {
                            return Err(AppError::Federation(format!(
                                "{} is not a collection page",
                                iri
                            )));
                        }
                    }
                }
            };

            if let Some(id) = &page.id {
                seen.insert(id.clone());
            }
            members.extend(page.member_iris().cloned());
            cursor = page.next;
        }

        Ok((members, pages))
    }

    /// Inboxes for the receivers the inbox resolver handed back
    ///
    /// Receivers that came out of this audience's traversal are looked up
    /// directly. Anything the resolver introduced may itself be a
    /// collection, so it is flattened first under the same depth budget.
    async fn remaining_inboxes(
        &self,
        ctx: &RequestContext,
        remaining: Vec<Url>,
        traversed: &[Url],
        depth: i32,
        actors: &mut ActorCache,
    ) -> Result<Vec<Url>> {
        let traversed: HashSet<&Url> = traversed.iter().collect();
        let (mut receivers, introduced): (Vec<Url>, Vec<Url>) = remaining
            .into_iter()
            .partition(|iri| traversed.contains(iri));

        if !introduced.is_empty() {
            receivers.extend(self.expand(ctx, introduced, depth, actors).await?);
        }
        self.personal_inboxes(ctx, &receivers, actors).await
    }

    /// Each receiver's own `inbox`, never its shared inbox
    async fn personal_inboxes(
        &self,
        ctx: &RequestContext,
        receivers: &[Url],
        actors: &mut ActorCache,
    ) -> Result<Vec<Url>> {
        let missing = unique(
            receivers
                .iter()
                .filter(|iri| !is_public(iri) && !actors.contains_key(*iri))
                .cloned(),
            &[],
        );

        let fetched: Vec<(Url, Result<Resource>)> = ctx
            .run(async {
                Ok(stream::iter(missing)
                    .map(|iri| async move {
                        let resource = self.fetch(ctx, &iri).await;
                        (iri, resource)
                    })
                    .buffer_unordered(self.settings.fetch_concurrency)
                    .collect()
                    .await)
            })
            .await?;

        for (iri, resource) in fetched {
            match resource? {
                Resource::Actor(actor) => {
                    actors.insert(iri, Some(actor));
                }
                _ => {
                    tracing::debug!(receiver = %iri, "Receiver is not an actor; no inbox");
                    actors.insert(iri, None);
                }
            }
        }

        Ok(receivers
            .iter()
            .filter_map(|iri| actors.get(iri)?.as_ref().map(|actor| actor.inbox.clone()))
            .collect())
    }

    /// Local documents come from the store, everything else over the wire
    async fn fetch(&self, ctx: &RequestContext, iri: &Url) -> Result<Resource> {
        if self.store.owns(ctx, iri).await? {
            let document = self
                .store
                .get(ctx, iri)
                .await?
                .ok_or_else(|| AppError::Federation(format!("Unknown local IRI {}", iri)))?;
            return Resource::from_value(document);
        }

        let result = self.transport.dereference(ctx, iri).await;
        let label = if result.is_ok() { "ok" } else { "error" };
        COLLECTION_FETCHES_TOTAL.with_label_values(&[label]).inc();
        if let Err(error) = &result {
            tracing::warn!(iri = %iri, %error, "Dereference failed during resolution");
        }
        result
    }
}

/// Sends activities to their resolved targets
pub struct Deliverer {
    resolver: Arc<DeliveryResolver>,
    transport: Arc<dyn Transport>,
}

impl Deliverer {
    pub fn new(resolver: Arc<DeliveryResolver>, transport: Arc<dyn Transport>) -> Self {
        Self {
            resolver,
            transport,
        }
    }

    pub fn resolver(&self) -> &DeliveryResolver {
        &self.resolver
    }

    /// Resolve targets for `activity` and deliver it
    pub async fn deliver(
        &self,
        ctx: &RequestContext,
        activity: &Activity,
    ) -> Result<Vec<DeliveryResult>> {
        let targets = self.resolver.resolve(ctx, activity).await?;
        self.send(ctx, activity, &targets).await
    }

    /// Deliver `activity` to already-resolved targets
    ///
    /// The copy on the wire has `bto` and `bcc` stripped.
    pub async fn send(
        &self,
        ctx: &RequestContext,
        activity: &Activity,
        targets: &DeliveryTargets,
    ) -> Result<Vec<DeliveryResult>> {
        let inboxes = targets.all();
        if inboxes.is_empty() {
            tracing::debug!(activity = ?activity.id, "No delivery targets");
            return Ok(Vec::new());
        }

        let body = activity.without_hidden_recipients().to_value()?;
        tracing::info!(
            activity = ?activity.id,
            activity_type = %activity.kind,
            inboxes = inboxes.len(),
            "Delivering activity"
        );

        ctx.run(async { Ok(self.transport.batch_deliver(ctx, &body, &inboxes).await) })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn unique_keeps_first_occurrence_and_skips_excluded() {
        let a = iri("https://a.example/inbox");
        let b = iri("https://b.example/inbox");
        let c = iri("https://c.example/inbox");

        let result = unique(vec![a.clone(), b.clone(), a.clone(), c.clone()], &[b]);
        assert_eq!(result, vec![a, c]);
    }

    #[test]
    fn all_merges_audiences_without_duplicates() {
        let shared = iri("https://a.example/inbox");
        let personal = iri("https://a.example/users/carol/inbox");
        let targets = DeliveryTargets {
            visible: vec![shared.clone(), personal.clone()],
            hidden: vec![personal.clone()],
        };

        assert_eq!(targets.all(), vec![shared, personal]);
        assert!(!targets.is_empty());
    }
}
