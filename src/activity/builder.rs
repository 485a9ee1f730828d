//! Activity builders
//!
//! Typed constructors for the activities the engine emits on its own,
//! namely the replies to an incoming Follow.

use serde_json::{Map, Value};
use url::Url;

use super::{Activity, ActivityType, ObjectRef};
use crate::error::{AppError, Result};

const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Mint a fresh activity IRI under `actor`
///
/// # Example
/// `https://local.example/users/alice/activities/01HV...`
pub fn new_activity_id(actor: &Url) -> Result<Url> {
    let raw = format!(
        "{}/activities/{}",
        actor.as_str().trim_end_matches('/'),
        ulid::Ulid::new().to_string().to_lowercase()
    );
    Url::parse(&raw).map_err(|e| AppError::Internal(e.into()))
}

/// Build an Accept activity
///
/// # Arguments
/// * `actor` - Actor IRI (accepter)
/// * `follow` - The Follow being accepted, embedded whole
pub fn accept(actor: &Url, follow: &Activity) -> Result<Activity> {
    respond(ActivityType::Accept, actor, follow)
}

/// Build a Reject activity.
pub fn reject(actor: &Url, follow: &Activity) -> Result<Activity> {
    respond(ActivityType::Reject, actor, follow)
}

fn respond(kind: ActivityType, actor: &Url, follow: &Activity) -> Result<Activity> {
    let mut extra = Map::new();
    extra.insert("@context".to_string(), Value::String(AS_CONTEXT.to_string()));

    Ok(Activity {
        id: Some(new_activity_id(actor)?),
        kind,
        actor: vec![ObjectRef::Iri(actor.clone())],
        object: vec![ObjectRef::Embedded(Box::new(follow.clone()))],
        to: follow.actor_iris()?,
        extra,
        ..Activity::default()
    })
}
