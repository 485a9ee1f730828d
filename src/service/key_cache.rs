//! Signing key cache
//!
//! Keeps the public keys remote actors advertise so that every signed
//! inbox POST does not cost a dereference of the signer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use url::Url;

use crate::activity::Resource;
use crate::context::RequestContext;
use crate::error::{AppError, Result};
use crate::federation::{Transport, advertised_key};

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct CachedKey {
    pem: String,
    fetched_at: Instant,
}

/// A key as returned by the cache
#[derive(Debug, Clone)]
pub struct SigningKey {
    pub pem: String,
    /// Whether the key came from the cache rather than a fresh fetch
    pub cached: bool,
}

/// Public keys by key id, fetched through the transport
pub struct ActorKeyCache {
    transport: Arc<dyn Transport>,
    keys: RwLock<HashMap<String, CachedKey>>,
    ttl: Duration,
}

impl ActorKeyCache {
    pub fn new(transport: Arc<dyn Transport>, ttl: Option<Duration>) -> Self {
        Self {
            transport,
            keys: RwLock::new(HashMap::new()),
            ttl: ttl.unwrap_or(DEFAULT_TTL),
        }
    }

    /// PEM for `key_id`, dereferencing `owner` on a miss
    ///
    /// # Errors
    /// - transport errors from the dereference
    /// - `Federation` if `owner` is not an actor
    /// - `Validation` if the actor does not advertise `key_id`
    pub async fn get(&self, ctx: &RequestContext, key_id: &str, owner: &Url) -> Result<SigningKey> {
        {
            let keys = self.keys.read().await;
            if let Some(entry) = keys.get(key_id) {
                if entry.fetched_at.elapsed() < self.ttl {
                    tracing::debug!(key_id, "Signing key cache hit");
                    return Ok(SigningKey {
                        pem: entry.pem.clone(),
                        cached: true,
                    });
                }
            }
        }

        tracing::debug!(key_id, owner = %owner, "Fetching signing key");
        let actor = match ctx.run(self.transport.dereference(ctx, owner)).await? {
            Resource::Actor(actor) => actor,
            _ => {
                return Err(AppError::Federation(format!(
                    "Key owner {} is not an actor",
                    owner
                )));
            }
        };
        let pem = advertised_key(&actor, key_id)?.to_string();

        self.keys.write().await.insert(
            key_id.to_string(),
            CachedKey {
                pem: pem.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(SigningKey { pem, cached: false })
    }

    /// Forget `key_id`, for instance after the owner rotated it
    pub async fn invalidate(&self, key_id: &str) {
        if self.keys.write().await.remove(key_id).is_some() {
            tracing::debug!(key_id, "Invalidated cached signing key");
        }
    }

    pub async fn prune_expired(&self) {
        let mut keys = self.keys.write().await;
        let before = keys.len();
        let ttl = self.ttl;
        keys.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
        let removed = before - keys.len();
        if removed > 0 {
            tracing::info!(removed, "Pruned expired signing keys");
        }
    }
}
