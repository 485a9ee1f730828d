//! Common test utilities for integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Uri};
use fedengine::activity::{Activity, OrderedCollectionPage, Resource};
use fedengine::config::{self, OnFollow};
use fedengine::context::RequestContext;
use fedengine::error::{AppError, Result};
use fedengine::federation::{
    ActivityHandler, Authenticator, Blocklist, CallbackProvider, FederationEngine,
    ForwardingFilter, InboxReader, InboxRequest, InboxResolution, InboxResolver, MemoryStore,
    OtherHandler, PassthroughResolver, Ports, RecursionLimits, RequestBodyHook, ResolvedInboxes,
    ResponseSink, Store, Transport, TraversalSettings, WrappedCallbacks, handler_fn,
};
use fedengine::service::{ConfiguredApplication, HttpSignatureAuthenticator};
use fedengine::AppState;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use url::Url;

pub const LOCAL_BASE: &str = "https://local.example";

pub fn iri(s: &str) -> Url {
    Url::parse(s).unwrap()
}

// ---------------------------------------------------------------------------
// Fixtures

pub fn actor_doc(id: &str, inbox: &str, shared_inbox: Option<&str>) -> Value {
    let mut doc = json!({
        "id": id,
        "type": "Person",
        "inbox": inbox,
    });
    if let Some(shared) = shared_inbox {
        doc["endpoints"] = json!({ "sharedInbox": shared });
    }
    doc
}

pub fn actor_with_key(id: &str, inbox: &str, public_key_pem: &str) -> Value {
    let mut doc = actor_doc(id, inbox, None);
    doc["publicKey"] = json!({
        "id": format!("{}#main-key", id),
        "owner": id,
        "publicKeyPem": public_key_pem,
    });
    doc
}

pub fn collection_doc(id: &str, items: &[&str]) -> Value {
    json!({
        "id": id,
        "type": "OrderedCollection",
        "totalItems": items.len(),
        "orderedItems": items,
    })
}

pub fn paged_collection_doc(id: &str, first: &str) -> Value {
    json!({
        "id": id,
        "type": "OrderedCollection",
        "first": first,
    })
}

pub fn page_doc(id: &str, items: &[&str], next: Option<&str>) -> Value {
    let mut doc = json!({
        "id": id,
        "type": "OrderedCollectionPage",
        "orderedItems": items,
    });
    if let Some(next) = next {
        doc["next"] = json!(next);
    }
    doc
}

pub fn activity(value: Value) -> Activity {
    Activity::from_value(value).unwrap()
}

pub fn inbox_request(inbox: &Url, body: &Value) -> InboxRequest {
    let uri: Uri = inbox.path().parse().unwrap();
    InboxRequest::new(
        Method::POST,
        uri,
        HeaderMap::new(),
        Bytes::from(serde_json::to_vec(body).unwrap()),
        inbox.clone(),
    )
}

// ---------------------------------------------------------------------------
// In-memory transport

/// Transport serving canned documents and recording every call
#[derive(Default)]
pub struct MockTransport {
    documents: Mutex<HashMap<Url, Value>>,
    failing: Mutex<HashSet<Url>>,
    fetches: Mutex<Vec<Url>>,
    deliveries: Mutex<Vec<(Url, Value)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `document` under its `id`
    pub fn insert(&self, document: Value) {
        let id = iri(document["id"].as_str().expect("document id"));
        self.documents.lock().unwrap().insert(id, document);
    }

    /// Make dereferences of `iri` fail
    pub fn fail(&self, target: &str) {
        self.failing.lock().unwrap().insert(iri(target));
    }

    pub fn fetch_count(&self, target: &str) -> usize {
        let target = iri(target);
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|fetched| **fetched == target)
            .count()
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn deliveries(&self) -> Vec<(Url, Value)> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn delivered_inboxes(&self) -> HashSet<Url> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|(inbox, _)| inbox.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dereference(&self, _ctx: &RequestContext, target: &Url) -> Result<Resource> {
        self.fetches.lock().unwrap().push(target.clone());
        if self.failing.lock().unwrap().contains(target) {
            return Err(AppError::Federation(format!("Fetch of {} failed", target)));
        }
        let document = self.documents.lock().unwrap().get(target).cloned();
        match document {
            Some(document) => Resource::from_value(document),
            None => Err(AppError::NotFound),
        }
    }

    async fn deliver(&self, _ctx: &RequestContext, body: &Value, inbox: &Url) -> Result<u16> {
        self.deliveries
            .lock()
            .unwrap()
            .push((inbox.clone(), body.clone()));
        Ok(202)
    }
}

// ---------------------------------------------------------------------------
// Port fakes

pub struct FixedLimits {
    pub forwarding: i32,
    pub delivery: i32,
}

impl RecursionLimits for FixedLimits {
    fn max_inbox_forwarding_recursion_depth(&self, _ctx: &RequestContext) -> i32 {
        self.forwarding
    }

    fn max_delivery_recursion_depth(&self, _ctx: &RequestContext) -> i32 {
        self.delivery
    }
}

/// Authenticates everything
pub struct AcceptAll;

#[async_trait]
impl Authenticator for AcceptAll {
    async fn authenticate_post_inbox(
        &self,
        ctx: RequestContext,
        _sink: &mut ResponseSink,
        _request: &InboxRequest,
    ) -> Result<(RequestContext, bool)> {
        Ok((ctx, true))
    }
}

/// Blocklist with a fixed answer that counts its calls
pub struct FixedBlocklist {
    pub blocked: bool,
    pub calls: AtomicUsize,
}

impl FixedBlocklist {
    pub fn new(blocked: bool) -> Arc<Self> {
        Arc::new(Self {
            blocked,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Blocklist for FixedBlocklist {
    async fn blocked(&self, _ctx: &RequestContext, _actor_iris: &[Url]) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.blocked)
    }
}

pub struct PassHook;

#[async_trait]
impl RequestBodyHook for PassHook {
    async fn post_inbox_request_body_hook(
        &self,
        ctx: RequestContext,
        _request: &InboxRequest,
        _activity: &Activity,
    ) -> Result<RequestContext> {
        Ok(ctx)
    }
}

pub struct FailingHook;

#[async_trait]
impl RequestBodyHook for FailingHook {
    async fn post_inbox_request_body_hook(
        &self,
        _ctx: RequestContext,
        _request: &InboxRequest,
        _activity: &Activity,
    ) -> Result<RequestContext> {
        Err(AppError::Store("hook storage unavailable".to_string()))
    }
}

/// Forwarding filter that keeps everything and remembers what it saw
#[derive(Default)]
pub struct RecordingFilter {
    pub seen: Mutex<Vec<(Vec<Url>, Value)>>,
    pub keep: bool,
}

impl RecordingFilter {
    pub fn keeping() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            keep: true,
        })
    }

    pub fn dropping() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            keep: false,
        })
    }
}

#[async_trait]
impl ForwardingFilter for RecordingFilter {
    async fn filter_forwarding(
        &self,
        _ctx: &RequestContext,
        candidates: Vec<Url>,
        activity: &Activity,
    ) -> Result<Vec<Url>> {
        self.seen
            .lock()
            .unwrap()
            .push((candidates.clone(), activity.to_value()?));
        Ok(if self.keep { candidates } else { Vec::new() })
    }
}

pub struct StoreInboxReader(pub Arc<MemoryStore>);

#[async_trait]
impl InboxReader for StoreInboxReader {
    async fn get_inbox(
        &self,
        ctx: &RequestContext,
        request: &InboxRequest,
    ) -> Result<OrderedCollectionPage> {
        self.0.inbox_page(ctx, &request.inbox, 0, 20).await
    }
}

/// Collapses known visible receivers into their shared inbox
pub struct SharedInboxResolver {
    pub shared: HashMap<Url, Url>,
}

#[async_trait]
impl InboxResolver for SharedInboxResolver {
    async fn resolve_inbox_iris(
        &self,
        _ctx: &RequestContext,
        visible: &[Url],
        hidden: &[Url],
    ) -> Result<ResolvedInboxes> {
        let mut resolution = InboxResolution::default();
        for receiver in visible {
            match self.shared.get(receiver) {
                Some(shared) => resolution.inboxes.push(shared.clone()),
                None => resolution.remaining.push(receiver.clone()),
            }
        }
        Ok(ResolvedInboxes {
            visible: resolution,
            hidden: InboxResolution::passthrough(hidden),
        })
    }
}

/// Resolver returning a fixed answer for the visible audience
pub struct FixedResolver {
    pub inboxes: Vec<Url>,
    pub remaining: Vec<Url>,
}

#[async_trait]
impl InboxResolver for FixedResolver {
    async fn resolve_inbox_iris(
        &self,
        _ctx: &RequestContext,
        _visible: &[Url],
        hidden: &[Url],
    ) -> Result<ResolvedInboxes> {
        Ok(ResolvedInboxes {
            visible: InboxResolution {
                inboxes: self.inboxes.clone(),
                remaining: self.remaining.clone(),
            },
            hidden: InboxResolution::passthrough(hidden),
        })
    }
}

/// Callback provider with counters
pub struct CountingCallbacks {
    pub wrapped: WrappedCallbacks,
    pub others: Vec<OtherHandler>,
    pub default_calls: AtomicUsize,
    pub provider_calls: AtomicUsize,
}

impl CountingCallbacks {
    pub fn new(wrapped: WrappedCallbacks, others: Vec<OtherHandler>) -> Arc<Self> {
        Arc::new(Self {
            wrapped,
            others,
            default_calls: AtomicUsize::new(0),
            provider_calls: AtomicUsize::new(0),
        })
    }

    pub fn default_calls(&self) -> usize {
        self.default_calls.load(Ordering::SeqCst)
    }

    pub fn provider_calls(&self) -> usize {
        self.provider_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallbackProvider for CountingCallbacks {
    async fn federating_callbacks(
        &self,
        _ctx: &RequestContext,
    ) -> Result<(WrappedCallbacks, Vec<OtherHandler>)> {
        self.provider_calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.wrapped.clone(), self.others.clone()))
    }

    async fn default_callback(&self, _ctx: &RequestContext, _activity: &Activity) -> Result<()> {
        self.default_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler that counts its invocations
pub fn counting_handler() -> (Arc<AtomicUsize>, Arc<dyn ActivityHandler>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = handler_fn(move |_ctx, _activity| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    (calls, handler)
}

// ---------------------------------------------------------------------------
// Engine wiring

/// Store with `alice` registered under `LOCAL_BASE`
pub async fn local_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(iri(LOCAL_BASE)));
    store.register_actor("alice", None).await.unwrap();
    store
}

pub fn alice() -> Url {
    iri(&format!("{}/users/alice", LOCAL_BASE))
}

pub fn alice_inbox() -> Url {
    iri(&format!("{}/users/alice/inbox", LOCAL_BASE))
}

pub fn alice_followers() -> Url {
    iri(&format!("{}/users/alice/followers", LOCAL_BASE))
}

/// Ports that let everything through, with passthrough inbox resolution
pub fn permissive_ports(store: Arc<MemoryStore>, callbacks: Arc<CountingCallbacks>) -> Ports {
    Ports {
        body_hook: Arc::new(PassHook),
        authenticator: Arc::new(AcceptAll),
        blocklist: FixedBlocklist::new(false),
        callbacks,
        limits: Arc::new(FixedLimits {
            forwarding: 8,
            delivery: 4,
        }),
        forwarding_filter: RecordingFilter::keeping(),
        inbox_reader: Arc::new(StoreInboxReader(store)),
        inbox_resolver: Arc::new(PassthroughResolver),
    }
}

pub fn engine(
    store: Arc<MemoryStore>,
    transport: Arc<MockTransport>,
    ports: Ports,
) -> FederationEngine {
    FederationEngine::new(store, transport, ports, TraversalSettings::default())
}

// ---------------------------------------------------------------------------
// HTTP test server

/// Options for `TestServer`
pub struct TestOptions {
    pub on_follow: OnFollow,
    pub blocked_domains: Vec<String>,
    /// Verify HTTP signatures instead of accepting every request
    pub verify_signatures: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            on_follow: OnFollow::Accept,
            blocked_domains: vec!["blocked.example".to_string()],
            verify_signatures: false,
        }
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub base_url: Url,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub transport: Arc<MockTransport>,
    pub client: reqwest::Client,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        // Bind first so the local IRIs carry the real port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: addr.to_string(),
                protocol: "http".to_string(),
            },
            federation: config::FederationConfig {
                max_inbox_forwarding_depth: 8,
                max_delivery_depth: 4,
                fetch_concurrency: 4,
                delivery_concurrency: 4,
                max_collection_pages: 16,
                request_timeout_seconds: 5,
                user_agent: "fedengine-test".to_string(),
                blocked_domains: options.blocked_domains,
                local_actors: vec!["alice".to_string()],
                on_follow: options.on_follow,
                rate_limit: config::RateLimitConfig {
                    max_requests: 100,
                    window_seconds: 60,
                },
                signing_key_path: None,
                signing_key_id: None,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let base_url = iri(&config.server.base_url());
        let store = Arc::new(MemoryStore::new(base_url.clone()));
        store.register_actor("alice", None).await.unwrap();

        let transport = MockTransport::new();
        let authenticator: Arc<dyn Authenticator> = if options.verify_signatures {
            Arc::new(HttpSignatureAuthenticator::new(
                transport.clone(),
                &config.federation.rate_limit,
            ))
        } else {
            Arc::new(AcceptAll)
        };
        let application = Arc::new(ConfiguredApplication::new(
            config.federation.clone(),
            store.clone(),
        ));
        let ports = Ports::from_application(application, authenticator);
        let engine = FederationEngine::new(
            store.clone(),
            transport.clone(),
            ports,
            TraversalSettings {
                fetch_concurrency: config.federation.fetch_concurrency,
                max_collection_pages: config.federation.max_collection_pages,
            },
        );

        let state = AppState {
            config: Arc::new(config),
            engine: Arc::new(engine),
        };
        let app = fedengine::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: format!("http://{}", addr),
            base_url,
            state,
            store,
            transport,
            client,
        }
    }

    /// Get URL for a request path
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Local IRI for a path
    pub fn local(&self, path: &str) -> Url {
        self.base_url.join(path).unwrap()
    }

    pub async fn post_activity(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("content-type", "application/activity+json")
            .body(serde_json::to_vec(body).unwrap())
            .send()
            .await
            .unwrap()
    }
}

// ---------------------------------------------------------------------------
// HTTP signatures

/// PKCS#8 private and SPKI public PEMs of a fresh key
pub fn keypair() -> (String, String) {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let private_pem = private_key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
    let public_pem = RsaPublicKey::from(&private_key)
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    (private_pem, public_pem)
}

impl TestServer {
    /// POST `body` to `path` signed with `private_pem` under `key_id`
    pub async fn post_signed(
        &self,
        path: &str,
        body: &Value,
        private_pem: &str,
        key_id: &str,
    ) -> reqwest::Response {
        let target = iri(&self.url(path));
        let bytes = serde_json::to_vec(body).unwrap();
        let signed =
            fedengine::federation::sign_request("POST", &target, Some(&bytes), private_pem, key_id)
                .unwrap();

        let mut request = self
            .client
            .post(target)
            .header("content-type", "application/activity+json")
            .header("date", signed.date)
            .header("signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("digest", digest);
        }
        request.body(bytes).send().await.unwrap()
    }
}
