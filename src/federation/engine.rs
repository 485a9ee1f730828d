//! Federation engine
//!
//! Entry point for server-to-server traffic. An inbox POST goes through:
//!
//! ```text
//! parse -> body hook -> authenticate -> blocklist -> inbox bookkeeping
//!       -> dispatch -> forwarding -> 200 OK
//! ```
//!
//! Each stage either passes the request on or ends it. A rejection is
//! written to the response sink exactly once; a hard error is returned to
//! the caller with nothing written.

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;

use super::delivery::{Deliverer, DeliveryResolver, DeliveryTargets, TraversalSettings};
use super::dispatch::Dispatcher;
use super::forwarding::InboxForwarder;
use super::gate::{self, AuthOutcome};
use super::protocol::{
    Authenticator, Blocklist, CallbackProvider, ForwardingFilter, InboxReader, InboxResolver,
    RecursionLimits, RequestBodyHook,
};
use super::request::{InboxRequest, ResponseSink, WrittenResponse};
use super::store::Store;
use super::transport::{DeliveryResult, Transport};
use super::wrapped::WrappedDefaults;
use crate::activity::{Activity, OrderedCollectionPage};
use crate::context::RequestContext;
use crate::error::{AppError, Result};
use crate::metrics::{ACTIVITIES_RECEIVED, INBOX_REQUEST_DURATION_SECONDS, INBOX_REQUESTS_TOTAL};

/// Application ports the engine is built with
#[derive(Clone)]
pub struct Ports {
    pub body_hook: Arc<dyn RequestBodyHook>,
    pub authenticator: Arc<dyn Authenticator>,
    pub blocklist: Arc<dyn Blocklist>,
    pub callbacks: Arc<dyn CallbackProvider>,
    pub limits: Arc<dyn RecursionLimits>,
    pub forwarding_filter: Arc<dyn ForwardingFilter>,
    pub inbox_reader: Arc<dyn InboxReader>,
    pub inbox_resolver: Arc<dyn InboxResolver>,
}

impl Ports {
    /// Take every port except authentication from one application value
    pub fn from_application<A>(application: Arc<A>, authenticator: Arc<dyn Authenticator>) -> Self
    where
        A: RequestBodyHook
            + Blocklist
            + CallbackProvider
            + RecursionLimits
            + ForwardingFilter
            + InboxReader
            + InboxResolver
            + 'static,
    {
        Self {
            body_hook: application.clone(),
            authenticator,
            blocklist: application.clone(),
            callbacks: application.clone(),
            limits: application.clone(),
            forwarding_filter: application.clone(),
            inbox_reader: application.clone(),
            inbox_resolver: application,
        }
    }
}

/// Federating protocol engine
pub struct FederationEngine {
    store: Arc<dyn Store>,
    body_hook: Arc<dyn RequestBodyHook>,
    authenticator: Arc<dyn Authenticator>,
    blocklist: Arc<dyn Blocklist>,
    inbox_reader: Arc<dyn InboxReader>,
    dispatcher: Dispatcher,
    forwarder: InboxForwarder,
    deliverer: Arc<Deliverer>,
}

impl FederationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        ports: Ports,
        settings: TraversalSettings,
    ) -> Self {
        let resolver = Arc::new(DeliveryResolver::new(
            store.clone(),
            transport.clone(),
            ports.inbox_resolver,
            ports.limits.clone(),
            settings,
        ));
        let deliverer = Arc::new(Deliverer::new(resolver, transport.clone()));
        let defaults = WrappedDefaults::new(store.clone(), transport.clone(), deliverer.clone());
        let forwarder = InboxForwarder::new(
            store.clone(),
            transport,
            ports.forwarding_filter,
            ports.limits,
            deliverer.clone(),
            settings.fetch_concurrency,
        );

        Self {
            store,
            body_hook: ports.body_hook,
            authenticator: ports.authenticator,
            blocklist: ports.blocklist,
            inbox_reader: ports.inbox_reader,
            dispatcher: Dispatcher::new(ports.callbacks, defaults),
            forwarder,
            deliverer,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Handle an inbox POST
    ///
    /// # Returns
    /// The response to send: `200` once the activity is accepted (or was
    /// already in the inbox), `400` for malformed activities, or whatever
    /// rejection a gate wrote.
    ///
    /// # Errors
    /// Hard errors from the body hook, the gates, the store, dispatch or
    /// forwarding. No response has been written in that case.
    pub async fn post_inbox(
        &self,
        ctx: RequestContext,
        request: &InboxRequest,
    ) -> Result<WrittenResponse> {
        let started = Instant::now();
        let result = self.handle_post_inbox(ctx, request).await;

        let outcome = match &result {
            Ok((_, outcome)) => *outcome,
            Err(AppError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        INBOX_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
        INBOX_REQUEST_DURATION_SECONDS
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());

        result.map(|(response, _)| response)
    }

    async fn handle_post_inbox(
        &self,
        ctx: RequestContext,
        request: &InboxRequest,
    ) -> Result<(WrittenResponse, &'static str)> {
        let mut sink = ResponseSink::new();

        let activity = match parse_inbox_activity(&request.body) {
            Ok(activity) => activity,
            Err(error) => {
                tracing::debug!(inbox = %request.inbox, %error, "Rejected malformed activity");
                sink.write(StatusCode::BAD_REQUEST, error.to_string());
                return finish(sink, "malformed");
            }
        };

        let ctx = self
            .body_hook
            .post_inbox_request_body_hook(ctx, request, &activity)
            .await?;

        let ctx = match gate::authenticate(&*self.authenticator, ctx, &mut sink, request).await? {
            AuthOutcome::Authenticated(ctx) => ctx,
            AuthOutcome::Rejected => return finish(sink, "unauthenticated"),
        };

        let actors = activity.actor_iris()?;
        if !gate::authorize(&*self.blocklist, &ctx, &actors, &mut sink).await? {
            return finish(sink, "blocked");
        }

        let id = activity.require_id()?;
        if self.store.inbox_contains(&ctx, &request.inbox, id).await? {
            tracing::debug!(inbox = %request.inbox, activity = %id, "Duplicate delivery");
            sink.write(StatusCode::OK, "");
            return finish(sink, "duplicate");
        }
        self.store
            .prepend_to_inbox(&ctx, &request.inbox, id)
            .await?;
        ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind.as_str()])
            .inc();

        match self
            .dispatcher
            .dispatch(&ctx, &request.inbox, &activity)
            .await
        {
            Ok(_) => {}
            Err(error) if error.is_malformed_activity() => {
                tracing::debug!(activity = %id, %error, "Activity rejected by wrapped default");
                sink.write(StatusCode::BAD_REQUEST, error.to_string());
                return finish(sink, "malformed");
            }
            Err(error) => return Err(error),
        }

        self.forwarder
            .forward_if_required(&ctx, &request.inbox, &activity)
            .await?;

        tracing::info!(
            inbox = %request.inbox,
            activity = %id,
            activity_type = %activity.kind,
            "Accepted activity"
        );
        sink.write(StatusCode::OK, "");
        finish(sink, "accepted")
    }

    /// Serve a page of an inbox through the application's reader
    pub async fn get_inbox(
        &self,
        ctx: &RequestContext,
        request: &InboxRequest,
    ) -> Result<OrderedCollectionPage> {
        ctx.run(self.inbox_reader.get_inbox(ctx, request)).await
    }

    /// Inbox endpoints `activity` would be delivered to
    pub async fn resolve_delivery_targets(
        &self,
        ctx: &RequestContext,
        activity: &Activity,
    ) -> Result<DeliveryTargets> {
        self.deliverer.resolver().resolve(ctx, activity).await
    }

    /// Resolve targets for `activity` and deliver it
    pub async fn deliver(
        &self,
        ctx: &RequestContext,
        activity: &Activity,
    ) -> Result<Vec<DeliveryResult>> {
        self.deliverer.deliver(ctx, activity).await
    }
}

/// A body is acceptable when it parses as an activity with an id
fn parse_inbox_activity(body: &[u8]) -> Result<Activity> {
    let activity = Activity::from_json(body)?;
    activity.require_id()?;
    Ok(activity)
}

fn finish(sink: ResponseSink, outcome: &'static str) -> Result<(WrittenResponse, &'static str)> {
    let response = sink
        .into_written()
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("No inbox response was written")))?;
    Ok((response, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_activity_without_id() {
        let body = br#"{"type":"Create","actor":"https://remote.example/users/bob","object":"https://remote.example/notes/1"}"#;
        assert!(matches!(
            parse_inbox_activity(body),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn parse_rejects_non_activity_objects() {
        let body = br#"{"id":"https://remote.example/notes/1","type":"Note","content":"hi"}"#;
        assert!(parse_inbox_activity(body).is_err());
    }

    #[test]
    fn parse_rejects_invalid_json() {
        assert!(parse_inbox_activity(b"{not json").is_err());
    }

    #[test]
    fn finish_requires_a_written_response() {
        assert!(finish(ResponseSink::new(), "accepted").is_err());

        let mut sink = ResponseSink::new();
        sink.write(StatusCode::OK, "");
        let (response, outcome) = finish(sink, "accepted").unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(outcome, "accepted");
    }
}
