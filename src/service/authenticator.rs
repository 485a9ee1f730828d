//! HTTP signature authentication for inbox POSTs
//!
//! Accepts a request when its draft-cavage signature verifies against the
//! key advertised by the activity's actor. Each sending domain is rate
//! limited before any key is fetched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use url::Url;

use super::key_cache::ActorKeyCache;
use super::rate_limit::{RateLimiter, domain_key};
use crate::activity::Activity;
use crate::config::RateLimitConfig;
use crate::context::RequestContext;
use crate::error::{AppError, Result};
use crate::federation::{
    Authenticator, InboxRequest, ResponseSink, Transport, extract_signature_key_id,
    key_id_matches_actor, verify_signature,
};

pub struct HttpSignatureAuthenticator {
    keys: ActorKeyCache,
    limiter: RateLimiter,
}

impl HttpSignatureAuthenticator {
    pub fn new(transport: Arc<dyn Transport>, rate_limit: &RateLimitConfig) -> Self {
        Self {
            keys: ActorKeyCache::new(transport, None),
            limiter: RateLimiter::new(
                rate_limit.max_requests,
                Duration::from_secs(rate_limit.window_seconds),
            ),
        }
    }

    /// Drop expired keys and rate limit windows
    pub async fn prune(&self) {
        self.keys.prune_expired().await;
        self.limiter.prune_expired().await;
    }

    fn reject(
        ctx: RequestContext,
        sink: &mut ResponseSink,
        status: StatusCode,
        reason: &str,
    ) -> Result<(RequestContext, bool)> {
        sink.write(status, reason.to_string());
        Ok((ctx, false))
    }

    /// Verify with the cached key, refetching once if the signer rotated it
    async fn verify(
        &self,
        ctx: &RequestContext,
        request: &InboxRequest,
        key_id: &str,
        owner: &Url,
    ) -> Result<()> {
        let body = (!request.body.is_empty()).then(|| request.body.as_ref());
        let check = |pem: &str| {
            verify_signature(
                request.method.as_str(),
                request.path_and_query(),
                &request.headers,
                body,
                pem,
            )
        };

        let key = self.keys.get(ctx, key_id, owner).await?;
        match check(&key.pem) {
            Err(AppError::InvalidSignature) if key.cached => {
                self.keys.invalidate(key_id).await;
                let fresh = self.keys.get(ctx, key_id, owner).await?;
                check(&fresh.pem)
            }
            result => result,
        }
    }
}

#[async_trait]
impl Authenticator for HttpSignatureAuthenticator {
    async fn authenticate_post_inbox(
        &self,
        ctx: RequestContext,
        sink: &mut ResponseSink,
        request: &InboxRequest,
    ) -> Result<(RequestContext, bool)> {
        let key_id = match extract_signature_key_id(&request.headers) {
            Ok(key_id) => key_id,
            Err(error) => {
                tracing::debug!(inbox = %request.inbox, %error, "Unsigned inbox request");
                return Self::reject(ctx, sink, StatusCode::UNAUTHORIZED, "Missing or invalid signature");
            }
        };
        let Ok(mut owner) = Url::parse(&key_id) else {
            return Self::reject(ctx, sink, StatusCode::UNAUTHORIZED, "Invalid signature keyId");
        };
        owner.set_fragment(None);

        let domain = domain_key(&owner);
        if self.limiter.check(&domain).await.is_err() {
            tracing::warn!(domain = %domain, "Inbox rate limit exceeded");
            return Self::reject(ctx, sink, StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
        }

        let activity = Activity::from_json(&request.body)?;
        let actors = activity.actor_iris()?;
        if !actors.iter().any(|actor| key_id_matches_actor(&key_id, actor)) {
            tracing::info!(key_id = %key_id, actors = ?actors, "Signature key does not belong to the activity actor");
            return Self::reject(ctx, sink, StatusCode::UNAUTHORIZED, "Signature does not match actor");
        }

        match self.verify(&ctx, request, &key_id, &owner).await {
            Ok(()) => {
                tracing::debug!(actor = %owner, "Verified inbox signature");
                Ok((ctx.with_authenticated_actor(owner), true))
            }
            Err(AppError::Cancelled) => Err(AppError::Cancelled),
            Err(error) => {
                tracing::info!(key_id = %key_id, %error, "Inbox signature rejected");
                Self::reject(ctx, sink, StatusCode::UNAUTHORIZED, "Invalid signature")
            }
        }
    }
}
