//! Authentication and authorization gates
//!
//! Both gates either let the request through or leave a rejection in the
//! response sink. A hard error from the application port propagates with
//! nothing written.

use axum::http::StatusCode;
use url::Url;

use super::protocol::{Authenticator, Blocklist};
use super::request::{InboxRequest, ResponseSink};
use crate::context::RequestContext;
use crate::error::Result;

/// Result of the authentication gate
#[derive(Debug)]
pub enum AuthOutcome {
    /// Continue with this context
    Authenticated(RequestContext),
    /// A rejection is in the sink; stop
    Rejected,
}

/// Run the application's authenticator
///
/// An authenticator that reports "not authenticated" is expected to have
/// written its own rejection; if it did not, `401` is written here.
pub async fn authenticate(
    authenticator: &dyn Authenticator,
    ctx: RequestContext,
    sink: &mut ResponseSink,
    request: &InboxRequest,
) -> Result<AuthOutcome> {
    let (ctx, authenticated) = authenticator
        .authenticate_post_inbox(ctx, sink, request)
        .await?;

    if authenticated {
        return Ok(AuthOutcome::Authenticated(ctx));
    }

    if !sink.is_written() {
        tracing::warn!(
            inbox = %request.inbox,
            "Authenticator rejected request without writing a response"
        );
        sink.write(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    Ok(AuthOutcome::Rejected)
}

/// Check the implicated actors against the application's blocklist
///
/// # Returns
/// `true` when the request may proceed; `false` after writing `403`.
pub async fn authorize(
    blocklist: &dyn Blocklist,
    ctx: &RequestContext,
    actor_iris: &[Url],
    sink: &mut ResponseSink,
) -> Result<bool> {
    if blocklist.blocked(ctx, actor_iris).await? {
        tracing::info!(actors = ?actor_iris, "Rejected activity from blocked actor");
        sink.write(StatusCode::FORBIDDEN, "Forbidden");
        return Ok(false);
    }
    Ok(true)
}
