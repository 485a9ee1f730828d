//! ActivityPub endpoints
//!
//! - Actor documents and follow collections
//! - Personal and shared inbox (activity receiving)
//! - Inbox reading

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, HeaderValue, Method, header},
    response::{IntoResponse, Response},
    routing::get,
};
use url::Url;

use crate::AppState;
use crate::context::RequestContext;
use crate::error::AppError;
use crate::federation::{InboxRequest, WrittenResponse};

const ACTIVITY_JSON: &str = "application/activity+json";

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - GET /users/:username/inbox - Inbox page
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", get(read_inbox).post(inbox))
        .route("/inbox", axum::routing::post(shared_inbox))
        .route("/users/:username/followers", get(local_document))
        .route("/users/:username/following", get(local_document))
}

fn local_iri(state: &AppState, path: &str) -> Result<Url, AppError> {
    let raw = format!("{}{}", state.config.server.base_url(), path);
    Url::parse(&raw).map_err(|e| AppError::Validation(format!("Invalid local IRI {}: {}", raw, e)))
}

fn activity_json(body: serde_json::Value) -> Response {
    (
        [(header::CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON))],
        axum::Json(body),
    )
        .into_response()
}

/// GET /users/:username
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let iri = local_iri(&state, &format!("/users/{}", username))?;
    let document = state
        .engine
        .store()
        .get(&RequestContext::new(), &iri)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(activity_json(document))
}

/// GET /users/:username/followers and /following
async fn local_document(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
) -> Result<Response, AppError> {
    let iri = local_iri(&state, uri.path())?;
    let document = state
        .engine
        .store()
        .get(&RequestContext::new(), &iri)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(activity_json(document))
}

/// POST /users/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<WrittenResponse, AppError> {
    let inbox = local_iri(&state, &format!("/users/{}/inbox", username))?;
    let ctx = RequestContext::new();
    if state.engine.store().actor_for_inbox(&ctx, &inbox).await?.is_none() {
        return Err(AppError::NotFound);
    }

    let request = InboxRequest::new(Method::POST, uri, headers, body, inbox);
    state.engine.post_inbox(ctx, &request).await
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<WrittenResponse, AppError> {
    let inbox = local_iri(&state, "/inbox")?;
    let request = InboxRequest::new(Method::POST, uri, headers, body, inbox);
    state.engine.post_inbox(RequestContext::new(), &request).await
}

/// GET /users/:username/inbox
async fn read_inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let inbox = local_iri(&state, &format!("/users/{}/inbox", username))?;
    let request = InboxRequest::new(Method::GET, uri, headers, Bytes::new(), inbox);

    let page = state
        .engine
        .get_inbox(&RequestContext::new(), &request)
        .await?;
    Ok(activity_json(serde_json::to_value(page)?))
}
