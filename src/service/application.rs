//! Config-driven application
//!
//! The ports a standalone deployment needs, answered from `AppConfig` and
//! the store: a domain blocklist, recursion budgets, a forwarding policy,
//! the inbox reader and logging callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use super::rate_limit::domain_key;
use crate::activity::{Activity, OrderedCollectionPage};
use crate::config::FederationConfig;
use crate::context::RequestContext;
use crate::error::Result;
use crate::federation::{
    Blocklist, CallbackProvider, CollectionKind, ForwardingFilter, InboxReader, InboxRequest,
    InboxResolver, OtherHandler, PassthroughResolver, RecursionLimits, RequestBodyHook,
    ResolvedInboxes, Store, WrappedCallbacks, handler_fn,
};

/// Items per inbox page
pub const INBOX_PAGE_SIZE: usize = 20;

pub struct ConfiguredApplication {
    federation: FederationConfig,
    store: Arc<dyn Store>,
}

impl ConfiguredApplication {
    pub fn new(federation: FederationConfig, store: Arc<dyn Store>) -> Self {
        Self { federation, store }
    }

    /// Whether `iri` is on a blocked domain or one of its subdomains
    fn is_blocked(&self, iri: &Url) -> bool {
        let domain = domain_key(iri);
        self.federation.blocked_domains.iter().any(|blocked| {
            let blocked = blocked.trim().trim_end_matches('.').to_ascii_lowercase();
            !blocked.is_empty()
                && (domain == blocked || domain.ends_with(&format!(".{}", blocked)))
        })
    }
}

#[async_trait]
impl RequestBodyHook for ConfiguredApplication {
    async fn post_inbox_request_body_hook(
        &self,
        ctx: RequestContext,
        request: &InboxRequest,
        activity: &Activity,
    ) -> Result<RequestContext> {
        let mut ctx = ctx.with_value("activity_type", activity.kind.as_str());
        if let Some(id) = &activity.id {
            ctx = ctx.with_value("activity_id", id.as_str());
        }
        tracing::debug!(
            request_id = %ctx.request_id(),
            inbox = %request.inbox,
            activity_type = %activity.kind,
            "Received inbox activity"
        );
        Ok(ctx)
    }
}

#[async_trait]
impl Blocklist for ConfiguredApplication {
    async fn blocked(&self, _ctx: &RequestContext, actor_iris: &[Url]) -> Result<bool> {
        Ok(actor_iris.iter().any(|iri| self.is_blocked(iri)))
    }
}

impl RecursionLimits for ConfiguredApplication {
    fn max_inbox_forwarding_recursion_depth(&self, _ctx: &RequestContext) -> i32 {
        self.federation.max_inbox_forwarding_depth
    }

    fn max_delivery_recursion_depth(&self, _ctx: &RequestContext) -> i32 {
        self.federation.max_delivery_depth
    }
}

/// Only followers collections receive forwarded activities
#[async_trait]
impl ForwardingFilter for ConfiguredApplication {
    async fn filter_forwarding(
        &self,
        _ctx: &RequestContext,
        candidates: Vec<Url>,
        activity: &Activity,
    ) -> Result<Vec<Url>> {
        let suffix = format!("/{}", CollectionKind::Followers.as_str());
        let (kept, dropped): (Vec<Url>, Vec<Url>) = candidates
            .into_iter()
            .partition(|iri| iri.path().trim_end_matches('/').ends_with(&suffix));

        if !dropped.is_empty() {
            tracing::debug!(
                activity = ?activity.id,
                dropped = ?dropped,
                "Collections excluded from forwarding"
            );
        }
        Ok(kept)
    }
}

#[async_trait]
impl CallbackProvider for ConfiguredApplication {
    async fn federating_callbacks(
        &self,
        _ctx: &RequestContext,
    ) -> Result<(WrappedCallbacks, Vec<OtherHandler>)> {
        let wrapped = WrappedCallbacks {
            on_follow: self.federation.on_follow,
            ..WrappedCallbacks::default()
        };

        let flag = OtherHandler::for_type(
            "Flag",
            handler_fn(|_ctx, activity: Activity| async move {
                tracing::warn!(
                    activity = ?activity.id,
                    actors = ?activity.actor_iris().unwrap_or_default(),
                    objects = ?activity.object_iris(),
                    "Received moderation report"
                );
                Ok(())
            }),
        );

        Ok((wrapped, vec![flag]))
    }

    async fn default_callback(&self, ctx: &RequestContext, activity: &Activity) -> Result<()> {
        tracing::info!(
            request_id = %ctx.request_id(),
            activity = ?activity.id,
            activity_type = %activity.kind,
            "No handler for activity type; ignoring"
        );
        Ok(())
    }
}

#[async_trait]
impl InboxResolver for ConfiguredApplication {
    async fn resolve_inbox_iris(
        &self,
        ctx: &RequestContext,
        visible: &[Url],
        hidden: &[Url],
    ) -> Result<ResolvedInboxes> {
        PassthroughResolver
            .resolve_inbox_iris(ctx, visible, hidden)
            .await
    }
}

#[async_trait]
impl InboxReader for ConfiguredApplication {
    async fn get_inbox(
        &self,
        ctx: &RequestContext,
        request: &InboxRequest,
    ) -> Result<OrderedCollectionPage> {
        let offset = request
            .uri
            .query()
            .and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == "offset")
                    .and_then(|(_, value)| value.parse::<usize>().ok())
            })
            .unwrap_or(0);

        self.store
            .inbox_page(ctx, &request.inbox, offset, INBOX_PAGE_SIZE)
            .await
    }
}
