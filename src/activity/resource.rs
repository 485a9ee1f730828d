//! Dereferenced resources
//!
//! When the engine fetches an IRI it only needs to know whether the result
//! is an actor (to find its inbox), a collection (to flatten it) or some
//! other object (to look inside it for forwarding evidence).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{Activity, ObjectRef, first_type, one_or_many, type_names};
use crate::error::{AppError, Result};

const COLLECTION_TYPES: &[&str] = &[
    "Collection",
    "OrderedCollection",
    "CollectionPage",
    "OrderedCollectionPage",
];

/// An actor document, reduced to what federation needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: Url,
    #[serde(rename = "type", default, deserialize_with = "first_type")]
    pub kind: String,
    pub inbox: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Endpoints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
}

impl Actor {
    /// Shared inbox advertised by the actor's server, if any
    pub fn shared_inbox(&self) -> Option<&Url> {
        self.endpoints.as_ref()?.shared_inbox.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<Url>,
}

/// Public key advertised on an actor for HTTP signatures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub id: String,
    pub owner: Url,
    pub public_key_pem: String,
}

/// Link to a collection page: an IRI or an embedded page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageRef {
    Iri(Url),
    Embedded(Box<Collection>),
}

/// Collection or collection page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    #[serde(rename = "type", default, deserialize_with = "first_type")]
    pub kind: String,
    #[serde(default, alias = "orderedItems", deserialize_with = "one_or_many")]
    pub items: Vec<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<PageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<PageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,
}

impl Collection {
    /// IRIs of the members on this page
    pub fn member_iris(&self) -> impl Iterator<Item = &Url> {
        self.items.iter().filter_map(ObjectRef::id)
    }
}

/// What a dereferenced IRI turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Actor(Actor),
    Collection(Collection),
    Object(Activity),
}

impl Resource {
    /// Classify a fetched JSON document
    ///
    /// Collections are recognised by type, actors by the presence of an
    /// inbox; everything else is a plain object.
    pub fn from_value(value: Value) -> Result<Self> {
        let is_collection = type_names(&value)
            .iter()
            .any(|kind| COLLECTION_TYPES.contains(kind));

        if is_collection {
            let collection: Collection = serde_json::from_value(value)
                .map_err(|e| AppError::Federation(format!("Malformed collection: {}", e)))?;
            return Ok(Resource::Collection(collection));
        }

        if value.get("inbox").is_some() {
            let actor: Actor = serde_json::from_value(value)
                .map_err(|e| AppError::Federation(format!("Malformed actor: {}", e)))?;
            return Ok(Resource::Actor(actor));
        }

        let object: Activity = serde_json::from_value(value)
            .map_err(|e| AppError::Federation(format!("Malformed object: {}", e)))?;
        Ok(Resource::Object(object))
    }

    pub fn id(&self) -> Option<&Url> {
        match self {
            Resource::Actor(actor) => Some(&actor.id),
            Resource::Collection(collection) => collection.id.as_ref(),
            Resource::Object(object) => object.id.as_ref(),
        }
    }
}

/// One page of an inbox as served to a reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollectionPage {
    pub id: Url,
    #[serde(rename = "type")]
    pub kind: String,
    pub part_of: Url,
    pub total_items: u64,
    pub ordered_items: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<Url>,
}

impl OrderedCollectionPage {
    pub fn new(id: Url, part_of: Url, total_items: u64, ordered_items: Vec<Value>) -> Self {
        Self {
            id,
            kind: "OrderedCollectionPage".to_string(),
            part_of,
            total_items,
            ordered_items,
            next: None,
            prev: None,
        }
    }
}
