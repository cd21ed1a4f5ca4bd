//! RTMS Bridge
//!
//! Receives stream lifecycle webhooks, holds the per-stream signaling and
//! media WebSockets, and forwards transcripts to the ingestion sink.

use rtms_bridge::channels::ChannelContext;
use rtms_bridge::config::Config;
use rtms_bridge::forwarder::TranscriptForwarder;
use rtms_bridge::observability::HealthState;
use rtms_bridge::registry::StreamRegistryHandle;
use rtms_bridge::routes::{self, AppState};
use rtms_bridge::signature::StreamSigner;
use rtms_bridge::transport::WebSocketTransportFactory;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtms_bridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting RTMS Bridge");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        client_id = %config.client_id,
        media_type = %config.media_type,
        ingestion_url = %config.ingestion_url,
        "Configuration loaded successfully"
    );

    let metrics_handle = routes::init_metrics_recorder().map_err(|e| {
        error!("Failed to initialize metrics recorder: {}", e);
        e
    })?;

    // tokio-tungstenite and reqwest both go through rustls; pick ring once
    // for the process. Fails only if a provider is already installed.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    let forwarder = TranscriptForwarder::new(config.ingestion_url.clone(), config.forward_timeout())?;

    let ctx = ChannelContext {
        signer: Arc::new(StreamSigner::new(
            config.client_id.clone(),
            config.client_secret.clone(),
        )),
        media_type: config.media_type,
        transports: Arc::new(WebSocketTransportFactory::new()),
        forwarder,
        teardown_timeout: config.teardown_timeout(),
    };

    let registry = StreamRegistryHandle::new(ctx);
    let health_state = Arc::new(HealthState::new());

    let bind_address = config.bind_address.clone();
    let drain_seconds = config.drain_seconds;

    let state = Arc::new(AppState {
        config,
        registry: registry.clone(),
    });

    let app = routes::build_routes(state, Arc::clone(&health_state), metrics_handle);

    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    health_state.set_ready();

    info!("RTMS Bridge listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&health_state), drain_seconds))
        .await?;

    info!("HTTP server stopped, closing stream sessions");

    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Registry shutdown failed, cancelling sessions");
        registry.cancel();
    }

    info!("RTMS Bridge shutdown complete");

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
/// Returns when a shutdown signal is received and drain period is complete.
async fn shutdown_signal(health_state: Arc<HealthState>, drain_seconds: u64) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    health_state.set_not_ready();

    if drain_seconds > 0 {
        warn!("Draining connections for {} seconds...", drain_seconds);
        tokio::time::sleep(Duration::from_secs(drain_seconds)).await;
        info!("Drain period complete");
    } else {
        info!("Skipping drain period (RTMS_DRAIN_SECONDS=0)");
    }
}
