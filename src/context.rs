//! Request-scoped context
//!
//! A `RequestContext` travels through every port call of one inbound
//! request or outbound delivery. It is immutable: enrichment returns a new
//! value, so a collaborator can never change what an earlier stage saw.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use ulid::Ulid;
use url::Url;

use crate::error::{AppError, Result};

/// Immutable per-request context with cooperative cancellation
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: Ulid,
    cancel: CancellationToken,
    values: Arc<BTreeMap<String, String>>,
    authenticated_actor: Option<Url>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// Fresh context with its own cancellation token
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Context that is cancelled together with `cancel`
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            request_id: Ulid::new(),
            cancel,
            values: Arc::new(BTreeMap::new()),
            authenticated_actor: None,
        }
    }

    pub fn request_id(&self) -> Ulid {
        self.request_id
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return a copy of this context carrying `key = value`
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.into(), value.into());
        Self {
            values: Arc::new(values),
            ..self.clone()
        }
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Return a copy of this context bound to the actor that signed the request
    pub fn with_authenticated_actor(&self, actor: Url) -> Self {
        Self {
            authenticated_actor: Some(actor),
            ..self.clone()
        }
    }

    pub fn authenticated_actor(&self) -> Option<&Url> {
        self.authenticated_actor.as_ref()
    }

    /// Drive `fut` to completion unless the context is cancelled first.
    ///
    /// A cancelled context yields `AppError::Cancelled` and drops `fut`,
    /// aborting whatever fetch or handler it was running.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AppError::Cancelled),
            result = fut => result,
        }
    }
}
