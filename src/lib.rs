//! fedengine - federated delivery engine for ActivityPub server-to-server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Inbox POST / GET, actor documents                        │
//! │  - Metrics                                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Engine                         │
//! │  - Gates: body hook, authentication, blocklist              │
//! │  - Dispatch: wrapped defaults, application handlers         │
//! │  - Inbox forwarding and delivery target resolution          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Ports and Adapters                           │
//! │  - Store (in-memory)                                        │
//! │  - Transport (reqwest, HTTP signatures)                     │
//! │  - Config-driven application                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `activity`: ActivityStreams model and builders
//! - `federation`: Engine, ports, dispatch, forwarding, delivery
//! - `service`: Config-driven port implementations
//! - `api`: HTTP handlers
//! - `context`: Request-scoped context
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod activity;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Largest inbox body accepted
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Federation engine wired with its ports
    pub engine: Arc<federation::FederationEngine>,
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
