//! ActivityStreams model
//!
//! Typed view over the JSON-LD payloads the engine routes. Only the
//! properties the engine reasons about are typed; everything else is kept
//! verbatim in `extra` so a forwarded or stored activity loses nothing.

pub mod builder;
pub mod resource;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{AppError, Result};

pub use resource::{Actor, Collection, OrderedCollectionPage, PageRef, Resource};

/// The special public audience collection
pub const PUBLIC_IRI: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Whether `iri` names the public audience
pub fn is_public(iri: &Url) -> bool {
    iri.as_str() == PUBLIC_IRI
}

/// ActivityStreams types the engine gives special treatment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActivityType {
    Accept,
    Add,
    Announce,
    Block,
    Create,
    Delete,
    Follow,
    Like,
    Reject,
    Remove,
    Undo,
    Update,
    /// Any other vocabulary or extension type
    Other(String),
}

/// Activity types from the ActivityStreams vocabulary that carry no default
/// side effect but still mark a payload as an activity.
const OTHER_ACTIVITY_TYPES: &[&str] = &[
    "Arrive",
    "Dislike",
    "Flag",
    "Ignore",
    "IntransitiveActivity",
    "Invite",
    "Join",
    "Leave",
    "Listen",
    "Move",
    "Offer",
    "Question",
    "Read",
    "TentativeAccept",
    "TentativeReject",
    "Travel",
    "View",
    "Activity",
];

impl ActivityType {
    /// Every type with a wrapped default behavior
    pub const WELL_KNOWN: [ActivityType; 12] = [
        ActivityType::Accept,
        ActivityType::Add,
        ActivityType::Announce,
        ActivityType::Block,
        ActivityType::Create,
        ActivityType::Delete,
        ActivityType::Follow,
        ActivityType::Like,
        ActivityType::Reject,
        ActivityType::Remove,
        ActivityType::Undo,
        ActivityType::Update,
    ];

    /// Parse activity type from string
    pub fn parse(s: &str) -> Self {
        match s {
            "Accept" => Self::Accept,
            "Add" => Self::Add,
            "Announce" => Self::Announce,
            "Block" => Self::Block,
            "Create" => Self::Create,
            "Delete" => Self::Delete,
            "Follow" => Self::Follow,
            "Like" => Self::Like,
            "Reject" => Self::Reject,
            "Remove" => Self::Remove,
            "Undo" => Self::Undo,
            "Update" => Self::Update,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Accept => "Accept",
            Self::Add => "Add",
            Self::Announce => "Announce",
            Self::Block => "Block",
            Self::Create => "Create",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Like => "Like",
            Self::Reject => "Reject",
            Self::Remove => "Remove",
            Self::Undo => "Undo",
            Self::Update => "Update",
            Self::Other(name) => name,
        }
    }

    pub fn is_well_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Whether the type belongs to the ActivityStreams activity vocabulary
    pub fn is_activity_vocabulary(&self) -> bool {
        match self {
            Self::Other(name) => OTHER_ACTIVITY_TYPES.contains(&name.as_str()),
            _ => true,
        }
    }
}

impl Default for ActivityType {
    fn default() -> Self {
        Self::Other("Object".to_string())
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ActivityType {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ActivityType> for String {
    fn from(value: ActivityType) -> Self {
        value.as_str().to_string()
    }
}

impl Serialize for ActivityType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActivityType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // Multi-typed objects route on their first type.
        match OneOrMany::<String>::deserialize(deserializer)? {
            OneOrMany::One(name) => Ok(Self::parse(&name)),
            OneOrMany::Many(names) => Ok(names
                .first()
                .map(|name| Self::parse(name))
                .unwrap_or_default()),
        }
    }
}

/// A property value: either a bare IRI or an embedded object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Iri(Url),
    Embedded(Box<Activity>),
}

impl ObjectRef {
    /// IRI of the referenced value, if it has one
    pub fn id(&self) -> Option<&Url> {
        match self {
            ObjectRef::Iri(iri) => Some(iri),
            ObjectRef::Embedded(object) => object.id.as_ref(),
        }
    }

    pub fn as_embedded(&self) -> Option<&Activity> {
        match self {
            ObjectRef::Embedded(object) => Some(object),
            ObjectRef::Iri(_) => None,
        }
    }
}

impl From<Url> for ObjectRef {
    fn from(value: Url) -> Self {
        ObjectRef::Iri(value)
    }
}

/// An ActivityStreams object; activities are objects with an actor.
///
/// Immutable once parsed: components that need a variant (for example the
/// copy sent over the wire without `bto`/`bcc`) build a new value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    #[serde(rename = "type", default)]
    pub kind: ActivityType,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty", serialize_with = "compact")]
    pub actor: Vec<ObjectRef>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty", serialize_with = "compact")]
    pub object: Vec<ObjectRef>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty", serialize_with = "compact")]
    pub target: Vec<ObjectRef>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty", serialize_with = "compact")]
    pub in_reply_to: Vec<ObjectRef>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty", serialize_with = "compact")]
    pub tag: Vec<ObjectRef>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty", serialize_with = "compact")]
    pub attributed_to: Vec<ObjectRef>,
    #[serde(default, deserialize_with = "recipients", skip_serializing_if = "Vec::is_empty", serialize_with = "compact")]
    pub to: Vec<Url>,
    #[serde(default, deserialize_with = "recipients", skip_serializing_if = "Vec::is_empty", serialize_with = "compact")]
    pub cc: Vec<Url>,
    #[serde(default, deserialize_with = "recipients", skip_serializing_if = "Vec::is_empty", serialize_with = "compact")]
    pub bto: Vec<Url>,
    #[serde(default, deserialize_with = "recipients", skip_serializing_if = "Vec::is_empty", serialize_with = "compact")]
    pub bcc: Vec<Url>,
    #[serde(default, deserialize_with = "recipients", skip_serializing_if = "Vec::is_empty", serialize_with = "compact")]
    pub audience: Vec<Url>,
    /// Properties the engine does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Activity {
    /// Parse a request body into an activity
    ///
    /// # Errors
    /// - `Validation` if the body is not a JSON object
    /// - `Validation` if the object is not an activity
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)?;
        if !value.is_object() {
            return Err(AppError::Validation(
                "Activity payload must be a JSON object".to_string(),
            ));
        }

        let activity: Activity = serde_json::from_value(value)?;
        if !activity.is_activity() {
            return Err(AppError::Validation(format!(
                "Payload of type {} is not an activity",
                activity.kind
            )));
        }
        Ok(activity)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Known activity types qualify, and so does any extension type that
    /// names an actor.
    pub fn is_activity(&self) -> bool {
        self.kind.is_activity_vocabulary() || !self.actor.is_empty()
    }

    /// IRI of this activity, required for everything the inbox does
    pub fn require_id(&self) -> Result<&Url> {
        self.id
            .as_ref()
            .ok_or_else(|| AppError::Validation("Activity is missing an id".to_string()))
    }

    /// IRIs of the actors that performed the activity
    ///
    /// # Errors
    /// `Validation` if an embedded actor has no id.
    pub fn actor_iris(&self) -> Result<Vec<Url>> {
        self.actor
            .iter()
            .map(|actor| {
                actor.id().cloned().ok_or_else(|| {
                    AppError::Validation("Embedded actor is missing an id".to_string())
                })
            })
            .collect()
    }

    /// IRIs of the activity's `object` values, skipping anonymous ones
    pub fn object_iris(&self) -> Vec<Url> {
        self.object.iter().filter_map(|o| o.id().cloned()).collect()
    }

    /// `to`, `cc` and `audience`, in that order
    pub fn visible_recipients(&self) -> Vec<Url> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.audience)
            .cloned()
            .collect()
    }

    /// `bto` and `bcc`, in that order
    pub fn hidden_recipients(&self) -> Vec<Url> {
        self.bto.iter().chain(&self.bcc).cloned().collect()
    }

    /// Copy of this activity with `bto` and `bcc` removed, recursively
    /// for embedded objects.
    pub fn without_hidden_recipients(&self) -> Activity {
        let mut copy = self.clone();
        copy.strip_hidden_recipients();
        copy
    }

    fn strip_hidden_recipients(&mut self) {
        self.bto.clear();
        self.bcc.clear();
        for value in self.object.iter_mut() {
            if let ObjectRef::Embedded(embedded) = value {
                embedded.strip_hidden_recipients();
            }
        }
    }

    /// Values that may point back at content owned by the receiving server
    pub fn forwarding_values(&self) -> impl Iterator<Item = &ObjectRef> {
        self.in_reply_to
            .iter()
            .chain(&self.object)
            .chain(&self.target)
            .chain(&self.tag)
    }
}

/// Untagged variants are tried in order: `Many` comes first so an array is
/// never taken whole as a single `Value`.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

pub(crate) fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

/// `type` may be a single name or a list; the first name is the one that
/// classifies the value.
pub(crate) fn first_type<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let names: Vec<String> = one_or_many(deserializer)?;
    Ok(names.into_iter().next().unwrap_or_default())
}

/// Every name in a raw `type` property
pub(crate) fn type_names(value: &Value) -> Vec<&str> {
    match value.get("type") {
        Some(Value::String(name)) => vec![name.as_str()],
        Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Single-valued properties go back on the wire as a bare value.
fn compact<S, T>(values: &[T], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: Serialize,
{
    match values {
        [single] => single.serialize(serializer),
        many => many.serialize(serializer),
    }
}

/// Addressing values are IRIs or embedded objects with an id. The compact
/// public forms are normalised to `PUBLIC_IRI`; anything else that does not
/// name an IRI cannot receive a delivery and is dropped.
fn recipients<'de, D>(deserializer: D) -> std::result::Result<Vec<Url>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Vec<Value> = one_or_many(deserializer)?;
    Ok(values.iter().filter_map(recipient_iri).collect())
}

fn recipient_iri(value: &Value) -> Option<Url> {
    let raw = match value {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("id").and_then(Value::as_str)?,
        _ => return None,
    };

    if raw == "as:Public" || raw == "Public" {
        return Url::parse(PUBLIC_IRI).ok();
    }

    match Url::parse(raw) {
        Ok(iri) => Some(iri),
        Err(error) => {
            tracing::debug!(recipient = %raw, %error, "Dropping unparseable recipient");
            None
        }
    }
}
