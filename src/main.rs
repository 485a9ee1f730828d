//! fedengine binary entry point

use std::sync::Arc;
use std::time::Duration;

use fedengine::config::{self, AppConfig};
use fedengine::error::AppError;
use fedengine::federation::{
    FederationEngine, HttpTransport, MemoryStore, Ports, SigningCredentials, TraversalSettings,
};
use fedengine::service::{ConfiguredApplication, HttpSignatureAuthenticator};
use fedengine::AppState;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Initialize metrics
/// 3. Load configuration from file and environment
/// 4. Register local actors and wire the engine
/// 5. Start background maintenance
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("FEDENGINE__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fedengine=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fedengine=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting fedengine...");

    // 2. Initialize metrics
    fedengine::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 4. Wire the engine
    let (state, authenticator) = build_state(config.clone()).await?;
    let app = fedengine::build_router(state);

    // 5. Start background maintenance
    spawn_maintenance_task(
        authenticator,
        Duration::from_secs(config.federation.rate_limit.window_seconds.max(1)),
    );

    // 6. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}

async fn build_state(
    config: AppConfig,
) -> Result<(AppState, Arc<HttpSignatureAuthenticator>), AppError> {
    let base_url = Url::parse(&config.server.base_url())
        .map_err(|e| AppError::Config(format!("Invalid server base URL: {}", e)))?;
    let federation = &config.federation;

    let signing = match (&federation.signing_key_path, &federation.signing_key_id) {
        (Some(path), Some(key_id)) => {
            let private_key_pem = tokio::fs::read_to_string(path).await.map_err(|e| {
                AppError::Config(format!("Cannot read signing key {}: {}", path.display(), e))
            })?;
            Some(SigningCredentials {
                key_id: key_id.clone(),
                private_key_pem,
            })
        }
        _ => None,
    };

    // Local actors
    let store = Arc::new(MemoryStore::new(base_url));
    for username in &federation.local_actors {
        let actor_key_id = format!("{}#main-key", config.server.actor_iri(username));
        let public_key_pem = match &signing {
            Some(credentials) if credentials.key_id == actor_key_id => {
                Some(public_key_pem(&credentials.private_key_pem)?)
            }
            _ => None,
        };
        store
            .register_actor(username, public_key_pem.as_deref())
            .await?;
    }

    // Transport
    let mut transport = HttpTransport::new(
        &federation.user_agent,
        Duration::from_secs(federation.request_timeout_seconds),
        federation.delivery_concurrency,
    )?;
    if config.server.protocol.eq_ignore_ascii_case("http") {
        transport = transport.allow_private_hosts();
    }
    if let Some(credentials) = signing {
        tracing::info!(key_id = %credentials.key_id, "Outbound deliveries will be signed");
        transport = transport.with_signing(credentials);
    }
    let transport = Arc::new(transport);

    // Ports
    let authenticator = Arc::new(HttpSignatureAuthenticator::new(
        transport.clone(),
        &federation.rate_limit,
    ));
    let application = Arc::new(ConfiguredApplication::new(federation.clone(), store.clone()));
    let ports = Ports::from_application(application, authenticator.clone());

    let engine = FederationEngine::new(
        store,
        transport,
        ports,
        TraversalSettings {
            fetch_concurrency: federation.fetch_concurrency,
            max_collection_pages: federation.max_collection_pages,
        },
    );

    let state = AppState {
        config: Arc::new(config),
        engine: Arc::new(engine),
    };
    Ok((state, authenticator))
}

/// PEM public half of a PKCS#8 private key
fn public_key_pem(private_key_pem: &str) -> Result<String, AppError> {
    use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Config(format!("Invalid signing key: {}", e)))?;
    rsa::RsaPublicKey::from(&private_key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Config(format!("Cannot encode public key: {}", e)))
}

/// Spawn background pruning of signing keys and rate limit windows
fn spawn_maintenance_task(authenticator: Arc<HttpSignatureAuthenticator>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // Consume the immediate first tick.
        interval.tick().await;

        loop {
            interval.tick().await;
            authenticator.prune().await;
        }
    });

    tracing::info!("Maintenance task spawned");
}
