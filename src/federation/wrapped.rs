//! Default side effects for the well-known activity types
//!
//! These run before the application's override for the same type. They
//! keep the store consistent with what the inbox received: objects created
//! and updated, follower and following collections, likes and shares.

use std::sync::Arc;

use url::Url;

use super::delivery::Deliverer;
use super::store::{CollectionKind, Store};
use super::transport::Transport;
use crate::activity::{Activity, ActivityType, ObjectRef, Resource, builder};
use crate::config::OnFollow;
use crate::context::RequestContext;
use crate::error::{AppError, Result};

/// Engine defaults for wrapped activity types
pub struct WrappedDefaults {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    deliverer: Arc<Deliverer>,
}

impl WrappedDefaults {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        deliverer: Arc<Deliverer>,
    ) -> Self {
        Self {
            store,
            transport,
            deliverer,
        }
    }

    /// Apply the default for `activity`, received at `inbox`
    ///
    /// # Errors
    /// - `ObjectRequired` when a type that needs an object has none
    /// - `TargetRequired` for Add and Remove without a target
    /// - `Forbidden` when an activity acts on objects its actor may not
    pub async fn apply(
        &self,
        ctx: &RequestContext,
        inbox: &Url,
        activity: &Activity,
        on_follow: OnFollow,
    ) -> Result<()> {
        match &activity.kind {
            ActivityType::Create => self.on_create(ctx, activity).await,
            ActivityType::Update => self.on_update(ctx, activity).await,
            ActivityType::Delete => self.on_delete(ctx, activity).await,
            ActivityType::Follow => self.on_follow(ctx, inbox, activity, on_follow).await,
            ActivityType::Accept => self.on_accept(ctx, inbox, activity).await,
            ActivityType::Reject => Ok(()),
            ActivityType::Add => self.on_add(ctx, activity).await,
            ActivityType::Remove => self.on_remove(ctx, activity).await,
            ActivityType::Like => self.on_like(ctx, activity).await,
            ActivityType::Announce => self.on_announce(ctx, activity).await,
            ActivityType::Undo => self.on_undo(ctx, activity).await,
            ActivityType::Block => require_object(activity),
            ActivityType::Other(_) => Ok(()),
        }
    }

    async fn on_create(&self, ctx: &RequestContext, activity: &Activity) -> Result<()> {
        require_object(activity)?;
        for value in &activity.object {
            let Some(object) = self.resolve_object(ctx, value).await? else {
                continue;
            };
            let id = object.require_id()?;
            if !self.store.exists(ctx, id).await? {
                self.store.create(ctx, &object).await?;
                tracing::debug!(object = %id, "Stored created object");
            }
        }
        Ok(())
    }

    async fn on_update(&self, ctx: &RequestContext, activity: &Activity) -> Result<()> {
        require_object(activity)?;
        for value in &activity.object {
            let Some(object) = self.resolve_object(ctx, value).await? else {
                continue;
            };
            let id = object.require_id()?;
            require_same_origin(activity, id)?;
            self.store.update(ctx, &object).await?;
            tracing::debug!(object = %id, "Stored updated object");
        }
        Ok(())
    }

    async fn on_delete(&self, ctx: &RequestContext, activity: &Activity) -> Result<()> {
        require_object(activity)?;
        for id in activity.object_iris() {
            require_same_origin(activity, &id)?;
            self.store.delete(ctx, &id).await?;
            tracing::debug!(object = %id, "Deleted object");
        }
        Ok(())
    }

    /// Follow of a local actor: record the follower when accepting, and
    /// answer according to `policy`.
    async fn on_follow(
        &self,
        ctx: &RequestContext,
        inbox: &Url,
        activity: &Activity,
        policy: OnFollow,
    ) -> Result<()> {
        require_object(activity)?;
        let Some(local_actor) = self
            .local_recipient(ctx, inbox, &activity.object_iris())
            .await?
        else {
            return Ok(());
        };

        let reply = match policy {
            OnFollow::Ignore => return Ok(()),
            OnFollow::Accept => {
                if let Some(followers) = self
                    .store
                    .collection_iri(ctx, &local_actor, CollectionKind::Followers)
                    .await?
                {
                    for follower in activity.actor_iris()? {
                        self.store.add_item(ctx, &followers, &follower).await?;
                    }
                }
                builder::accept(&local_actor, activity)?
            }
            OnFollow::Reject => builder::reject(&local_actor, activity)?,
        };

        let results = self.deliverer.deliver(ctx, &reply).await?;
        for result in results.iter().filter(|r| !r.success) {
            tracing::warn!(
                inbox = %result.inbox,
                error = ?result.error,
                reply = %reply.kind,
                "Follow reply delivery failed"
            );
        }
        Ok(())
    }

    /// Accept of a Follow the local actor sent: record the accepting actors
    /// as followed.
    async fn on_accept(&self, ctx: &RequestContext, inbox: &Url, activity: &Activity) -> Result<()> {
        require_object(activity)?;
        for value in &activity.object {
            let Some(follow) = self.resolve_object(ctx, value).await? else {
                continue;
            };
            if follow.kind != ActivityType::Follow {
                continue;
            }
            let Some(local_actor) = self
                .local_recipient(ctx, inbox, &follow.actor_iris()?)
                .await?
            else {
                continue;
            };
            if let Some(following) = self
                .store
                .collection_iri(ctx, &local_actor, CollectionKind::Following)
                .await?
            {
                for followed in activity.actor_iris()? {
                    self.store.add_item(ctx, &following, &followed).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_add(&self, ctx: &RequestContext, activity: &Activity) -> Result<()> {
        require_object(activity)?;
        require_target(activity)?;
        for target in self.owned_collection_targets(ctx, activity).await? {
            for object in activity.object_iris() {
                self.store.add_item(ctx, &target, &object).await?;
            }
        }
        Ok(())
    }

    async fn on_remove(&self, ctx: &RequestContext, activity: &Activity) -> Result<()> {
        require_object(activity)?;
        require_target(activity)?;
        for target in self.owned_collection_targets(ctx, activity).await? {
            for object in activity.object_iris() {
                self.store.remove_item(ctx, &target, &object).await?;
            }
        }
        Ok(())
    }

    async fn on_like(&self, ctx: &RequestContext, activity: &Activity) -> Result<()> {
        require_object(activity)?;
        self.record_reaction(ctx, activity, CollectionKind::Likes).await
    }

    async fn on_announce(&self, ctx: &RequestContext, activity: &Activity) -> Result<()> {
        self.record_reaction(ctx, activity, CollectionKind::Shares).await
    }

    /// The undoing actors must be the actors of every undone activity
    async fn on_undo(&self, ctx: &RequestContext, activity: &Activity) -> Result<()> {
        require_object(activity)?;
        let actors = activity.actor_iris()?;
        for value in &activity.object {
            let Some(undone) = self.resolve_object(ctx, value).await? else {
                continue;
            };
            let undone_actors = undone.actor_iris()?;
            if undone_actors.is_empty() || undone_actors.iter().any(|a| !actors.contains(a)) {
                return Err(AppError::Forbidden);
            }
        }
        Ok(())
    }

    /// Record the activity in the likes or shares collection of each
    /// local object it reacts to.
    async fn record_reaction(
        &self,
        ctx: &RequestContext,
        activity: &Activity,
        kind: CollectionKind,
    ) -> Result<()> {
        let Some(id) = activity.id.as_ref() else {
            return Ok(());
        };
        for object in activity.object_iris() {
            if !self.store.owns(ctx, &object).await? {
                continue;
            }
            if let Some(collection) = self.store.collection_iri(ctx, &object, kind).await? {
                self.store.add_item(ctx, &collection, id).await?;
            }
        }
        Ok(())
    }

    async fn owned_collection_targets(
        &self,
        ctx: &RequestContext,
        activity: &Activity,
    ) -> Result<Vec<Url>> {
        let mut targets = Vec::new();
        for target in activity.target.iter().filter_map(ObjectRef::id) {
            if self.store.owns(ctx, target).await?
                && self.store.collection_items(ctx, target).await?.is_some()
            {
                targets.push(target.clone());
            }
        }
        Ok(targets)
    }

    /// The local actor among `candidates` this activity concerns
    ///
    /// A personal inbox answers for its owner only. The shared inbox
    /// answers for any stored local candidate.
    async fn local_recipient(
        &self,
        ctx: &RequestContext,
        inbox: &Url,
        candidates: &[Url],
    ) -> Result<Option<Url>> {
        if let Some(owner) = self.store.actor_for_inbox(ctx, inbox).await? {
            return Ok(candidates.contains(&owner).then_some(owner));
        }
        for candidate in candidates {
            if self.store.owns(ctx, candidate).await? && self.store.exists(ctx, candidate).await? {
                return Ok(Some(candidate.clone()));
            }
        }
        Ok(None)
    }

    /// Embedded objects as given; IRIs from the store, else dereferenced.
    /// Returns `None` for IRIs that name an actor or collection.
    async fn resolve_object(
        &self,
        ctx: &RequestContext,
        value: &ObjectRef,
    ) -> Result<Option<Activity>> {
        let iri = match value {
            ObjectRef::Embedded(object) => return Ok(Some((**object).clone())),
            ObjectRef::Iri(iri) => iri,
        };

        if let Some(document) = self.store.get(ctx, iri).await? {
            return Ok(Some(Activity::from_value(document)?));
        }
        if self.store.owns(ctx, iri).await? {
            return Err(AppError::NotFound);
        }
        match self.transport.dereference(ctx, iri).await? {
            Resource::Object(object) => Ok(Some(object)),
            _ => Ok(None),
        }
    }
}

fn require_object(activity: &Activity) -> Result<()> {
    if activity.object.is_empty() {
        return Err(AppError::ObjectRequired);
    }
    Ok(())
}

fn require_target(activity: &Activity) -> Result<()> {
    if activity.target.is_empty() {
        return Err(AppError::TargetRequired);
    }
    Ok(())
}

/// An activity may only modify objects on its own origin
fn require_same_origin(activity: &Activity, object: &Url) -> Result<()> {
    let origin = activity.require_id()?.origin();
    if origin != object.origin() {
        tracing::warn!(
            activity = ?activity.id,
            object = %object,
            "Activity targets an object on another origin"
        );
        return Err(AppError::Forbidden);
    }
    Ok(())
}
