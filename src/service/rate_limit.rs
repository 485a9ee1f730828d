//! Per-domain rate limiting for inbound federation
//!
//! Fixed windows keyed by the sending server's domain. The number of
//! tracked domains is capped; when full, expired windows are dropped
//! first and then the oldest window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use url::Url;

use crate::error::{AppError, Result};

const DEFAULT_MAX_TRACKED_DOMAINS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

impl Window {
    fn expired(&self, length: Duration) -> bool {
        self.started.elapsed() >= length
    }
}

/// Request budget per domain and window
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    max_requests: u32,
    window: Duration,
    max_tracked: usize,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self::with_capacity(max_requests, window, DEFAULT_MAX_TRACKED_DOMAINS)
    }

    pub fn with_capacity(max_requests: u32, window: Duration, max_tracked: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests: max_requests.max(1),
            window,
            max_tracked: max_tracked.max(1),
        }
    }

    /// Count one request from `domain`
    ///
    /// # Errors
    /// `RateLimited` once the domain has used its budget for the current
    /// window; the rejected request is not counted.
    pub async fn check(&self, domain: &str) -> Result<()> {
        let mut windows = self.windows.lock().await;

        if !windows.contains_key(domain) && windows.len() >= self.max_tracked {
            let window = self.window;
            windows.retain(|_, w| !w.expired(window));
            if windows.len() >= self.max_tracked {
                let oldest = windows
                    .iter()
                    .min_by_key(|(_, w)| w.started)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    windows.remove(&oldest);
                }
            }
        }

        let entry = windows.entry(domain.to_string()).or_insert(Window {
            started: Instant::now(),
            count: 0,
        });
        if entry.expired(self.window) {
            *entry = Window {
                started: Instant::now(),
                count: 0,
            };
        }
        if entry.count >= self.max_requests {
            tracing::debug!(domain, count = entry.count, "Rate limit exceeded");
            return Err(AppError::RateLimited);
        }
        entry.count += 1;
        Ok(())
    }

    /// Requests counted for `domain` in its current window
    pub async fn count(&self, domain: &str) -> u32 {
        let windows = self.windows.lock().await;
        windows
            .get(domain)
            .filter(|w| !w.expired(self.window))
            .map(|w| w.count)
            .unwrap_or(0)
    }

    /// Drop every expired window
    pub async fn prune_expired(&self) {
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        let window = self.window;
        windows.retain(|_, w| !w.expired(window));
        let removed = before - windows.len();
        if removed > 0 {
            tracing::debug!(removed, "Pruned expired rate limit windows");
        }
    }
}

/// Rate limit and blocklist key for an IRI: lowercase host, with the port
/// only when it is not the scheme default
pub fn domain_key(iri: &Url) -> String {
    let host = iri
        .host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    // `Url::port` is already `None` for the scheme's default port.
    match iri.port() {
        Some(port) if host.contains(':') => format!("[{}]:{}", host, port),
        Some(port) => format!("{}:{}", host, port),
        None => host,
    }
}
