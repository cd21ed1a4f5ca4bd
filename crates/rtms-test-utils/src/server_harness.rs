//! Test server harness for E2E testing
//!
//! Provides `TestBridgeServer` for spawning real bridge instances in tests.

use crate::fixtures::{TEST_CLIENT_ID, TEST_CLIENT_SECRET, TEST_WEBHOOK_SECRET};
use metrics_exporter_prometheus::PrometheusBuilder;
use rtms_bridge::channels::ChannelContext;
use rtms_bridge::config::Config;
use rtms_bridge::forwarder::TranscriptForwarder;
use rtms_bridge::observability::HealthState;
use rtms_bridge::registry::StreamRegistryHandle;
use rtms_bridge::routes::{self, AppState};
use rtms_bridge::signature::StreamSigner;
use rtms_bridge::transport::WebSocketTransportFactory;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Test harness for spawning the RTMS bridge in E2E tests.
///
/// The bridge runs with real WebSocket transports, so signaling URLs in
/// webhook events should point at a [`crate::MockRtmsServer`].
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health() -> Result<(), anyhow::Error> {
///     let server = TestBridgeServer::spawn("http://127.0.0.1:9/ingest").await?;
///     let response = reqwest::get(format!("{}/health", server.url())).await?;
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestBridgeServer {
    addr: SocketAddr,
    config: Config,
    registry: StreamRegistryHandle,
    health_state: Arc<HealthState>,
    client: reqwest::Client,
    _handle: JoinHandle<()>,
}

impl TestBridgeServer {
    /// Spawn a bridge forwarding transcripts to `ingestion_url`.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the HTTP server in the background
    /// - Report ready immediately
    pub async fn spawn(ingestion_url: &str) -> Result<Self, anyhow::Error> {
        Self::spawn_with_vars(ingestion_url, HashMap::new()).await
    }

    /// Like [`TestBridgeServer::spawn`], with extra environment variables
    /// layered over the defaults.
    pub async fn spawn_with_vars(
        ingestion_url: &str,
        overrides: HashMap<String, String>,
    ) -> Result<Self, anyhow::Error> {
        // Both providers may be compiled in; tests pick ring like main does.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut vars = HashMap::from([
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("RTMS_CLIENT_ID".to_string(), TEST_CLIENT_ID.to_string()),
            (
                "RTMS_CLIENT_SECRET".to_string(),
                TEST_CLIENT_SECRET.to_string(),
            ),
            (
                "RTMS_WEBHOOK_SECRET_TOKEN".to_string(),
                TEST_WEBHOOK_SECRET.to_string(),
            ),
            ("RTMS_INGESTION_URL".to_string(), ingestion_url.to_string()),
            ("RTMS_FORWARD_TIMEOUT_SECONDS".to_string(), "2".to_string()),
            ("RTMS_TEARDOWN_TIMEOUT_SECONDS".to_string(), "2".to_string()),
        ]);
        vars.extend(overrides);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let forwarder =
            TranscriptForwarder::new(config.ingestion_url.clone(), config.forward_timeout())
                .map_err(|e| anyhow::anyhow!("Failed to create forwarder: {}", e))?;

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

        let state = Arc::new(AppState {
            config: config.clone(),
            registry: registry.clone(),
        });

        // A standalone recorder, so each test server renders its own
        // /metrics without touching the global recorder.
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();

        let app = routes::build_routes(state, Arc::clone(&health_state), metrics_handle);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        health_state.set_ready();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            config,
            registry,
            health_state,
            client: reqwest::Client::new(),
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Direct handle to the registry behind the HTTP surface.
    pub fn registry(&self) -> &StreamRegistryHandle {
        &self.registry
    }

    pub fn health_state(&self) -> &Arc<HealthState> {
        &self.health_state
    }

    /// POST `event` to `/webhook`.
    pub async fn post_webhook(&self, event: &Value) -> Result<reqwest::Response, anyhow::Error> {
        self.client
            .post(format!("{}/webhook", self.url()))
            .json(event)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Webhook request failed: {}", e))
    }

    /// GET `/api/v1/streams` as JSON.
    pub async fn streams(&self) -> Result<Value, anyhow::Error> {
        let response = self
            .client
            .get(format!("{}/api/v1/streams", self.url()))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Status request failed: {}", e))?;

        response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Status response was not JSON: {}", e))
    }
}

impl Drop for TestBridgeServer {
    fn drop(&mut self) {
        // Closes every session socket along with the HTTP server.
        self.registry.cancel();
        self._handle.abort();
    }
}
