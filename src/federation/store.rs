//! Object store
//!
//! The engine's view of persistent state: which IRIs this server owns,
//! the objects it has seen, the collections it maintains and the contents
//! of each local inbox. `MemoryStore` keeps all of it in process.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use url::Url;

use crate::activity::{Activity, Actor, OrderedCollectionPage};
use crate::context::RequestContext;
use crate::error::{AppError, Result};

/// Collections kept for local actors and objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    Followers,
    Following,
    Likes,
    Shares,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Followers => "followers",
            CollectionKind::Following => "following",
            CollectionKind::Likes => "likes",
            CollectionKind::Shares => "shares",
        }
    }
}

/// Persistent state the engine reads and updates
#[async_trait]
pub trait Store: Send + Sync {
    /// Whether `iri` is served by this server
    async fn owns(&self, ctx: &RequestContext, iri: &Url) -> Result<bool>;

    async fn exists(&self, ctx: &RequestContext, iri: &Url) -> Result<bool>;

    async fn get(&self, ctx: &RequestContext, iri: &Url) -> Result<Option<Value>>;

    /// Store a new object under its id
    async fn create(&self, ctx: &RequestContext, object: &Activity) -> Result<()>;

    /// Replace a stored object
    async fn update(&self, ctx: &RequestContext, object: &Activity) -> Result<()>;

    async fn delete(&self, ctx: &RequestContext, iri: &Url) -> Result<()>;

    async fn inbox_contains(&self, ctx: &RequestContext, inbox: &Url, id: &Url) -> Result<bool>;

    /// Record `id` as the newest item of `inbox`
    async fn prepend_to_inbox(&self, ctx: &RequestContext, inbox: &Url, id: &Url) -> Result<()>;

    async fn inbox_page(
        &self,
        ctx: &RequestContext,
        inbox: &Url,
        offset: usize,
        limit: usize,
    ) -> Result<OrderedCollectionPage>;

    /// Local actor that owns `inbox`
    async fn actor_for_inbox(&self, ctx: &RequestContext, inbox: &Url) -> Result<Option<Url>>;

    /// IRI of the `kind` collection of an owned actor or object
    async fn collection_iri(
        &self,
        ctx: &RequestContext,
        owner: &Url,
        kind: CollectionKind,
    ) -> Result<Option<Url>>;

    /// Members of an owned collection, `None` if `collection` is not one
    async fn collection_items(
        &self,
        ctx: &RequestContext,
        collection: &Url,
    ) -> Result<Option<Vec<Url>>>;

    async fn add_item(&self, ctx: &RequestContext, collection: &Url, item: &Url) -> Result<()>;

    async fn remove_item(&self, ctx: &RequestContext, collection: &Url, item: &Url)
    -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: HashMap<Url, Value>,
    collections: HashMap<Url, Vec<Url>>,
    /// Newest first
    inboxes: HashMap<Url, Vec<Url>>,
    inbox_owners: HashMap<Url, Url>,
}

/// In-process store for a single server
pub struct MemoryStore {
    base_url: Url,
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Create a store that owns every IRI on the origin of `base_url`
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            state: RwLock::new(MemoryState::default()),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn is_owned(&self, iri: &Url) -> bool {
        iri.origin() == self.base_url.origin()
    }

    fn join(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::Store(format!("Invalid local path {}: {}", path, e)))
    }

    fn child(owner: &Url, segment: &str) -> Result<Url> {
        let raw = format!("{}/{}", owner.as_str().trim_end_matches('/'), segment);
        Url::parse(&raw).map_err(|e| AppError::Store(format!("Invalid IRI {}: {}", raw, e)))
    }

    /// Register a local actor with its inbox and follow collections
    ///
    /// # Arguments
    /// * `username` - Path segment under `/users/`
    /// * `public_key_pem` - Key advertised for HTTP signatures, if any
    pub async fn register_actor(
        &self,
        username: &str,
        public_key_pem: Option<&str>,
    ) -> Result<Actor> {
        let id = self.join(&format!("/users/{}", username))?;
        let inbox = Self::child(&id, "inbox")?;
        let outbox = Self::child(&id, "outbox")?;
        let followers = Self::child(&id, CollectionKind::Followers.as_str())?;
        let following = Self::child(&id, CollectionKind::Following.as_str())?;

        let mut document = json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": id,
            "type": "Person",
            "preferredUsername": username,
            "inbox": inbox,
            "outbox": outbox,
            "followers": followers,
            "following": following,
            "endpoints": {"sharedInbox": self.join("/inbox")?},
        });
        if let Some(pem) = public_key_pem {
            document["publicKey"] = json!({
                "id": format!("{}#main-key", id),
                "owner": id,
                "publicKeyPem": pem,
            });
        }

        let actor: Actor = serde_json::from_value(document.clone())
            .map_err(|e| AppError::Store(format!("Invalid actor document: {}", e)))?;

        let shared_inbox = self.join("/inbox")?;
        let mut state = self.state.write().await;
        state.objects.insert(id.clone(), document);
        state.collections.entry(followers).or_default();
        state.collections.entry(following).or_default();
        state.inboxes.entry(inbox.clone()).or_default();
        state.inboxes.entry(shared_inbox).or_default();
        state.inbox_owners.insert(inbox, id.clone());

        tracing::info!(actor = %id, "Registered local actor");
        Ok(actor)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn owns(&self, _ctx: &RequestContext, iri: &Url) -> Result<bool> {
        Ok(self.is_owned(iri))
    }

    async fn exists(&self, _ctx: &RequestContext, iri: &Url) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.objects.contains_key(iri) || state.collections.contains_key(iri))
    }

    async fn get(&self, _ctx: &RequestContext, iri: &Url) -> Result<Option<Value>> {
        let state = self.state.read().await;
        if let Some(object) = state.objects.get(iri) {
            return Ok(Some(object.clone()));
        }

        Ok(state.collections.get(iri).map(|items| {
            json!({
                "id": iri,
                "type": "OrderedCollection",
                "totalItems": items.len(),
                "orderedItems": items,
            })
        }))
    }

    async fn create(&self, _ctx: &RequestContext, object: &Activity) -> Result<()> {
        let id = object
            .id
            .clone()
            .ok_or_else(|| AppError::Store("Cannot create an object without an id".to_string()))?;
        let value = object.to_value()?;

        let mut state = self.state.write().await;
        state.objects.entry(id).or_insert(value);
        Ok(())
    }

    async fn update(&self, _ctx: &RequestContext, object: &Activity) -> Result<()> {
        let id = object
            .id
            .clone()
            .ok_or_else(|| AppError::Store("Cannot update an object without an id".to_string()))?;
        let value = object.to_value()?;

        let mut state = self.state.write().await;
        state.objects.insert(id, value);
        Ok(())
    }

    async fn delete(&self, _ctx: &RequestContext, iri: &Url) -> Result<()> {
        let mut state = self.state.write().await;
        state.objects.remove(iri);
        Ok(())
    }

    async fn inbox_contains(&self, _ctx: &RequestContext, inbox: &Url, id: &Url) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .inboxes
            .get(inbox)
            .is_some_and(|items| items.contains(id)))
    }

    async fn prepend_to_inbox(&self, _ctx: &RequestContext, inbox: &Url, id: &Url) -> Result<()> {
        let mut state = self.state.write().await;
        let items = state
            .inboxes
            .get_mut(inbox)
            .ok_or_else(|| AppError::Store(format!("Unknown inbox {}", inbox)))?;
        items.insert(0, id.clone());
        Ok(())
    }

    async fn inbox_page(
        &self,
        _ctx: &RequestContext,
        inbox: &Url,
        offset: usize,
        limit: usize,
    ) -> Result<OrderedCollectionPage> {
        let state = self.state.read().await;
        let items = state.inboxes.get(inbox).ok_or(AppError::NotFound)?;

        let ordered_items = items
            .iter()
            .skip(offset)
            .take(limit)
            .map(|id| {
                state
                    .objects
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| Value::String(id.to_string()))
            })
            .collect();

        let page_url = |offset: usize| {
            let mut url = inbox.clone();
            url.query_pairs_mut()
                .clear()
                .append_pair("page", "true")
                .append_pair("offset", &offset.to_string());
            url
        };

        let mut page =
            OrderedCollectionPage::new(page_url(offset), inbox.clone(), items.len() as u64, ordered_items);
        if offset + limit < items.len() {
            page.next = Some(page_url(offset + limit));
        }
        if offset > 0 {
            page.prev = Some(page_url(offset.saturating_sub(limit)));
        }
        Ok(page)
    }

    async fn actor_for_inbox(&self, _ctx: &RequestContext, inbox: &Url) -> Result<Option<Url>> {
        let state = self.state.read().await;
        Ok(state.inbox_owners.get(inbox).cloned())
    }

    async fn collection_iri(
        &self,
        _ctx: &RequestContext,
        owner: &Url,
        kind: CollectionKind,
    ) -> Result<Option<Url>> {
        if !self.is_owned(owner) {
            return Ok(None);
        }
        Self::child(owner, kind.as_str()).map(Some)
    }

    async fn collection_items(
        &self,
        _ctx: &RequestContext,
        collection: &Url,
    ) -> Result<Option<Vec<Url>>> {
        let state = self.state.read().await;
        Ok(state.collections.get(collection).cloned())
    }

    async fn add_item(&self, _ctx: &RequestContext, collection: &Url, item: &Url) -> Result<()> {
        if !self.is_owned(collection) {
            return Err(AppError::Store(format!(
                "Cannot modify remote collection {}",
                collection
            )));
        }

        let mut state = self.state.write().await;
        let items = state.collections.entry(collection.clone()).or_default();
        if !items.contains(item) {
            items.push(item.clone());
        }
        Ok(())
    }

    async fn remove_item(
        &self,
        _ctx: &RequestContext,
        collection: &Url,
        item: &Url,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(items) = state.collections.get_mut(collection) {
            items.retain(|existing| existing != item);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(Url::parse("https://local.example").unwrap())
    }

    #[tokio::test]
    async fn register_actor_creates_inbox_and_collections() {
        let store = store();
        let ctx = RequestContext::new();
        let actor = store.register_actor("alice", None).await.unwrap();

        assert_eq!(actor.id.as_str(), "https://local.example/users/alice");
        assert_eq!(
            store.actor_for_inbox(&ctx, &actor.inbox).await.unwrap(),
            Some(actor.id.clone())
        );
        let followers = actor.followers.unwrap();
        assert_eq!(
            store.collection_items(&ctx, &followers).await.unwrap(),
            Some(Vec::new())
        );
    }

    #[tokio::test]
    async fn owns_is_decided_by_origin() {
        let store = store();
        let ctx = RequestContext::new();
        assert!(
            store
                .owns(&ctx, &Url::parse("https://local.example/notes/1").unwrap())
                .await
                .unwrap()
        );
        assert!(
            !store
                .owns(&ctx, &Url::parse("https://remote.example/notes/1").unwrap())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn inbox_pages_are_newest_first() {
        let store = store();
        let ctx = RequestContext::new();
        let actor = store.register_actor("alice", None).await.unwrap();

        for n in 1..=3 {
            let id = Url::parse(&format!("https://remote.example/activities/{}", n)).unwrap();
            store.prepend_to_inbox(&ctx, &actor.inbox, &id).await.unwrap();
        }

        let page = store.inbox_page(&ctx, &actor.inbox, 0, 2).await.unwrap();
        assert_eq!(page.total_items, 3);
        assert_eq!(
            page.ordered_items[0],
            Value::String("https://remote.example/activities/3".to_string())
        );
        assert!(page.next.is_some());
        assert!(page.prev.is_none());
    }

    #[tokio::test]
    async fn add_item_refuses_remote_collections() {
        let store = store();
        let ctx = RequestContext::new();
        let remote = Url::parse("https://remote.example/users/bob/followers").unwrap();
        let item = Url::parse("https://local.example/users/alice").unwrap();

        assert!(matches!(
            store.add_item(&ctx, &remote, &item).await,
            Err(AppError::Store(_))
        ));
    }

    #[tokio::test]
    async fn get_renders_local_collections() {
        let store = store();
        let ctx = RequestContext::new();
        let actor = store.register_actor("alice", None).await.unwrap();
        let followers = actor.followers.unwrap();
        let bob = Url::parse("https://remote.example/users/bob").unwrap();
        store.add_item(&ctx, &followers, &bob).await.unwrap();
        store.add_item(&ctx, &followers, &bob).await.unwrap();

        let rendered = store.get(&ctx, &followers).await.unwrap().unwrap();
        assert_eq!(rendered["type"], "OrderedCollection");
        assert_eq!(rendered["totalItems"], 1);
    }
}
