//! Application ports
//!
//! Everything the engine cannot decide on its own is asked of the
//! application through these traits. They are passed to the engine
//! explicitly when it is built; there is no global registry.

use async_trait::async_trait;
use url::Url;

use super::dispatch::{OtherHandler, WrappedCallbacks};
use super::request::{InboxRequest, ResponseSink};
use crate::activity::{Activity, OrderedCollectionPage};
use crate::context::RequestContext;
use crate::error::Result;

/// Hook run on every parsed inbox POST before authentication
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestBodyHook: Send + Sync {
    /// Returns the context later stages will see. An error aborts the
    /// request without a response being written.
    async fn post_inbox_request_body_hook(
        &self,
        ctx: RequestContext,
        request: &InboxRequest,
        activity: &Activity,
    ) -> Result<RequestContext>;
}

/// Proves who sent an inbox POST
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// # Returns
    /// - `Err` on a hard failure; nothing is written to `sink`
    /// - `Ok((ctx, false))` when the sender is not authenticated; the
    ///   authenticator is expected to have written the rejection
    /// - `Ok((ctx, true))` with a possibly enriched context
    async fn authenticate_post_inbox(
        &self,
        ctx: RequestContext,
        sink: &mut ResponseSink,
        request: &InboxRequest,
    ) -> Result<(RequestContext, bool)>;
}

/// Decides whether any implicated actor is blocked
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Blocklist: Send + Sync {
    async fn blocked(&self, ctx: &RequestContext, actor_iris: &[Url]) -> Result<bool>;
}

/// Supplies the handlers the dispatcher routes to
#[async_trait]
pub trait CallbackProvider: Send + Sync {
    /// Overrides for the well-known types plus handlers for any other type
    async fn federating_callbacks(
        &self,
        ctx: &RequestContext,
    ) -> Result<(WrappedCallbacks, Vec<OtherHandler>)>;

    /// Runs for activities no other handler claims
    async fn default_callback(&self, ctx: &RequestContext, activity: &Activity) -> Result<()>;
}

/// Recursion budgets; zero or negative means unbounded
#[cfg_attr(test, mockall::automock)]
pub trait RecursionLimits: Send + Sync {
    fn max_inbox_forwarding_recursion_depth(&self, ctx: &RequestContext) -> i32;
    fn max_delivery_recursion_depth(&self, ctx: &RequestContext) -> i32;
}

/// Narrows the collections an inbound activity is forwarded to
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForwardingFilter: Send + Sync {
    /// `activity` is the activity as received and is only lent out for
    /// inspection.
    async fn filter_forwarding(
        &self,
        ctx: &RequestContext,
        candidates: Vec<Url>,
        activity: &Activity,
    ) -> Result<Vec<Url>>;
}

/// Serves the inbox to readers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InboxReader: Send + Sync {
    async fn get_inbox(
        &self,
        ctx: &RequestContext,
        request: &InboxRequest,
    ) -> Result<OrderedCollectionPage>;
}

/// Outcome of resolving one audience (visible or hidden)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboxResolution {
    /// Inbox endpoints the application resolved itself
    pub inboxes: Vec<Url>,
    /// Receivers the engine must resolve through their actor document
    pub remaining: Vec<Url>,
}

impl InboxResolution {
    /// Leave every receiver to the engine
    pub fn passthrough(receivers: &[Url]) -> Self {
        Self {
            inboxes: Vec::new(),
            remaining: receivers.to_vec(),
        }
    }
}

/// Resolutions for both audiences, never merged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedInboxes {
    pub visible: InboxResolution,
    pub hidden: InboxResolution,
}

/// Lets the application collapse receivers into shared endpoints
///
/// Precondition: inboxes returned for `hidden` receivers must be personal
/// endpoints. A shared inbox would reveal the hidden receiver to everyone
/// else delivered there.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InboxResolver: Send + Sync {
    async fn resolve_inbox_iris(
        &self,
        ctx: &RequestContext,
        visible: &[Url],
        hidden: &[Url],
    ) -> Result<ResolvedInboxes>;
}

/// Resolver that leaves every receiver to the per-actor path
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

#[async_trait]
impl InboxResolver for PassthroughResolver {
    async fn resolve_inbox_iris(
        &self,
        _ctx: &RequestContext,
        visible: &[Url],
        hidden: &[Url],
    ) -> Result<ResolvedInboxes> {
        Ok(ResolvedInboxes {
            visible: InboxResolution::passthrough(visible),
            hidden: InboxResolution::passthrough(hidden),
        })
    }
}
