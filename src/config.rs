//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Actor IRI for a local username
    pub fn actor_iri(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url(), username)
    }
}

/// What a local actor does with an incoming Follow
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnFollow {
    /// Leave the Follow for the application to answer
    #[default]
    Ignore,
    /// Add the follower and send an Accept
    Accept,
    /// Send a Reject
    Reject,
}

/// Federation engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Recursion budget when looking for owned values to justify inbox
    /// forwarding. Zero or negative means unbounded.
    pub max_inbox_forwarding_depth: i32,
    /// Recursion budget when flattening recipient collections.
    /// Zero or negative means unbounded.
    pub max_delivery_depth: i32,
    /// Concurrent dereferences per traversal wave
    pub fetch_concurrency: usize,
    /// Concurrent outbound deliveries
    pub delivery_concurrency: usize,
    /// Pages read per collection before giving up on the rest
    pub max_collection_pages: usize,
    /// Outbound request timeout
    pub request_timeout_seconds: u64,
    /// User-Agent sent on outbound requests
    pub user_agent: String,
    /// Remote domains whose actors are refused
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    /// Usernames served by this instance
    #[serde(default)]
    pub local_actors: Vec<String>,
    #[serde(default)]
    pub on_follow: OnFollow,
    pub rate_limit: RateLimitConfig,
    /// PEM private key used to sign outbound deliveries
    pub signing_key_path: Option<PathBuf>,
    /// keyId advertised with outbound signatures
    pub signing_key_id: Option<String>,
}

/// Per-domain inbound rate limit
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDENGINE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost")?
            .set_default("server.protocol", "http")?
            .set_default("federation.max_inbox_forwarding_depth", 8)?
            .set_default("federation.max_delivery_depth", 4)?
            .set_default("federation.fetch_concurrency", 8)?
            .set_default("federation.delivery_concurrency", 10)?
            .set_default("federation.max_collection_pages", 64)?
            .set_default("federation.request_timeout_seconds", 30)?
            .set_default("federation.user_agent", "fedengine/0.1.0")?
            .set_default("federation.on_follow", "ignore")?
            .set_default("federation.rate_limit.max_requests", 100)?
            .set_default("federation.rate_limit.window_seconds", 60)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDENGINE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("federation.blocked_domains")
                    .with_list_parse_key("federation.local_actors"),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        let protocol = self.server.protocol.to_ascii_lowercase();
        if protocol != "http" && protocol != "https" {
            return Err(crate::error::AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if protocol == "http" {
            if is_local_server_domain(&self.server.domain) {
                let host = normalized_server_host(&self.server.domain);
                tracing::warn!(
                    host = %host,
                    "Serving federation over plain http for local development"
                );
            } else {
                return Err(crate::error::AppError::Config(
                    "server.protocol must be https for non-local server domains".to_string(),
                ));
            }
        }

        if self.federation.fetch_concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "federation.fetch_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.federation.delivery_concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.federation.signing_key_path.is_some() != self.federation.signing_key_id.is_some() {
            return Err(crate::error::AppError::Config(
                "federation.signing_key_path and federation.signing_key_id must be set together"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Lowercased host part of a configured domain or IRI host
pub fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
