//! Transport
//!
//! Dereferences remote IRIs and POSTs activities to inboxes. The engine
//! only talks to the network through the `Transport` trait, so tests and
//! embedders can substitute their own.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use url::Url;

use crate::activity::Resource;
use crate::context::RequestContext;
use crate::error::{AppError, Result};
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS};

const ACTIVITY_JSON: &str = "application/activity+json";
const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
const DEFAULT_DELIVERY_CONCURRENCY: usize = 10;

/// Outcome of delivering to one inbox
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub inbox: Url,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn from_outcome(inbox: Url, outcome: Result<u16>) -> Self {
        match outcome {
            Ok(status) => Self {
                inbox,
                success: true,
                status_code: Some(status),
                error: None,
            },
            Err(error) => Self {
                inbox,
                success: false,
                status_code: None,
                error: Some(error.to_string()),
            },
        }
    }
}

/// Network access used by the engine
///
/// Implementations must be safe for concurrent use: traversals issue
/// several dereferences at once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch and classify the document at `iri`
    async fn dereference(&self, ctx: &RequestContext, iri: &Url) -> Result<Resource>;

    /// POST `body` to `inbox`, returning the HTTP status on success
    async fn deliver(&self, ctx: &RequestContext, body: &Value, inbox: &Url) -> Result<u16>;

    /// Deliver `body` to every inbox, reporting one result per inbox
    async fn batch_deliver(
        &self,
        ctx: &RequestContext,
        body: &Value,
        inboxes: &[Url],
    ) -> Vec<DeliveryResult> {
        stream::iter(inboxes.to_vec())
            .map(|inbox| async move {
                let outcome = ctx.run(self.deliver(ctx, body, &inbox)).await;
                DeliveryResult::from_outcome(inbox, outcome)
            })
            .buffer_unordered(DEFAULT_DELIVERY_CONCURRENCY)
            .collect()
            .await
    }
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

/// Hosts that must never be fetched from or delivered to
pub fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<()> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve host {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(format!("No DNS records for {}", host)));
    }

    Ok(())
}

/// Key used to sign outbound requests
#[derive(Clone)]
pub struct SigningCredentials {
    pub key_id: String,
    pub private_key_pem: String,
}

impl std::fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// reqwest-backed transport with HTTP signatures and a private-address guard
#[derive(Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    signing: Option<Arc<SigningCredentials>>,
    delivery_concurrency: usize,
    allow_private_hosts: bool,
}

impl HttpTransport {
    /// Create a transport
    ///
    /// # Arguments
    /// * `user_agent` - Sent on every request
    /// * `timeout` - Per-request timeout
    /// * `delivery_concurrency` - Concurrent POSTs in `batch_deliver`
    pub fn new(user_agent: &str, timeout: Duration, delivery_concurrency: usize) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            http_client,
            signing: None,
            delivery_concurrency: delivery_concurrency.max(1),
            allow_private_hosts: false,
        })
    }

    /// Sign every request with `credentials`
    pub fn with_signing(mut self, credentials: SigningCredentials) -> Self {
        self.signing = Some(Arc::new(credentials));
        self
    }

    /// Permit loopback and private destinations, for local development
    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    async fn guard(&self, iri: &Url) -> Result<()> {
        match iri.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::Validation(format!(
                    "Unsupported IRI scheme: {}",
                    scheme
                )));
            }
        }

        if self.allow_private_hosts {
            return Ok(());
        }

        let host = iri
            .host_str()
            .ok_or_else(|| AppError::Validation(format!("Missing host in {}", iri)))?;
        if is_disallowed_host(host) {
            return Err(AppError::Forbidden);
        }

        let port = iri
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation(format!("Missing port in {}", iri)))?;
        validate_resolved_host_ips(host, port).await
    }

    fn signed(
        &self,
        mut request: reqwest::RequestBuilder,
        method: &str,
        iri: &Url,
        body: Option<&[u8]>,
    ) -> Result<reqwest::RequestBuilder> {
        let Some(credentials) = &self.signing else {
            return Ok(request);
        };

        let headers = super::signature::sign_request(
            method,
            iri,
            body,
            &credentials.private_key_pem,
            &credentials.key_id,
        )?;
        request = request
            .header("Date", headers.date)
            .header("Signature", headers.signature);
        if let Some(digest) = headers.digest {
            request = request.header("Digest", digest);
        }
        Ok(request)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dereference(&self, _ctx: &RequestContext, iri: &Url) -> Result<Resource> {
        self.guard(iri).await?;

        let request = self
            .http_client
            .get(iri.as_str())
            .header("Accept", ACCEPT_ACTIVITY);
        let response = self
            .signed(request, "GET", iri, None)?
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch {}: {}", iri, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch {}: HTTP {}",
                iri,
                response.status()
            )));
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse {}: {}", iri, e)))?;

        tracing::debug!(iri = %iri, "Dereferenced remote document");
        Resource::from_value(document)
    }

    async fn deliver(&self, _ctx: &RequestContext, body: &Value, inbox: &Url) -> Result<u16> {
        self.guard(inbox).await?;

        let payload = serde_json::to_vec(body)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let request = self
            .http_client
            .post(inbox.as_str())
            .header("Content-Type", ACTIVITY_JSON);
        let response = self
            .signed(request, "POST", inbox, Some(&payload))?
            .body(payload)
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to deliver to {}: {}", inbox, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox, status
            )));
        }

        tracing::info!(inbox = %inbox, status = status.as_u16(), "Delivered activity");
        Ok(status.as_u16())
    }

    async fn batch_deliver(
        &self,
        ctx: &RequestContext,
        body: &Value,
        inboxes: &[Url],
    ) -> Vec<DeliveryResult> {
        use tokio::sync::Semaphore;

        let semaphore = Arc::new(Semaphore::new(self.delivery_concurrency));
        let body = Arc::new(body.clone());
        let mut tasks = Vec::with_capacity(inboxes.len());

        for inbox in inboxes.iter().cloned() {
            let semaphore = semaphore.clone();
            let body = body.clone();
            let transport = self.clone();
            let ctx = ctx.clone();

            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return DeliveryResult::from_outcome(
                        inbox,
                        Err(AppError::Federation("Delivery pool closed".to_string())),
                    );
                };

                let started = Instant::now();
                let outcome = ctx.run(transport.deliver(&ctx, &body, &inbox)).await;
                let status = if outcome.is_ok() { "success" } else { "failure" };
                DELIVERIES_TOTAL.with_label_values(&[status]).inc();
                DELIVERY_DURATION_SECONDS
                    .with_label_values(&[status])
                    .observe(started.elapsed().as_secs_f64());

                if let Err(error) = &outcome {
                    tracing::error!(inbox = %inbox, %error, "Delivery failed");
                }
                DeliveryResult::from_outcome(inbox, outcome)
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(error) => tracing::error!(%error, "Delivery task panicked"),
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        tracing::info!(
            succeeded = success_count,
            failed = results.len() - success_count,
            "Batch delivery complete"
        );

        results
    }
}
