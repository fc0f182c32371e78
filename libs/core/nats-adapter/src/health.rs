//! Health endpoints for K8s probes.

use crate::broker::Publisher;
use crate::lifecycle::Lifecycle;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Health status of the adapters.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub broker_connected: bool,
    pub components_running: bool,
    /// Registered components that are not running
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stopped_components: Vec<String>,
}

/// Shared health state.
#[derive(Clone, Default)]
pub struct HealthState {
    inner: Arc<RwLock<HealthStateInner>>,
}

#[derive(Default)]
struct HealthStateInner {
    components: Vec<Arc<dyn Lifecycle>>,
    publisher: Option<Arc<dyn Publisher>>,
    fatal_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `component` to be running for readiness.
    pub async fn register(&self, component: Arc<dyn Lifecycle>) {
        self.inner.write().await.components.push(component);
    }

    /// Require the broker connection of `publisher` for readiness.
    pub async fn set_publisher(&self, publisher: Arc<dyn Publisher>) {
        self.inner.write().await.publisher = Some(publisher);
    }

    /// Mark the process as broken. Liveness fails from now on.
    pub async fn set_fatal_error(&self, error: impl Into<String>) {
        self.inner.write().await.fatal_error = Some(error.into());
    }

    /// Check if alive (for liveness).
    ///
    /// A broker disconnection or a stopped container does not fail liveness;
    /// only a fatal error does.
    pub async fn is_alive(&self) -> bool {
        self.inner.read().await.fatal_error.is_none()
    }

    /// Check if ready: broker connected and every registered component running.
    pub async fn is_ready(&self) -> bool {
        let status = self.status().await;
        status.broker_connected && status.components_running && self.is_alive().await
    }

    pub async fn status(&self) -> HealthStatus {
        let inner = self.inner.read().await;
        let broker_connected = inner
            .publisher
            .as_ref()
            .map_or(true, |p| p.is_connected());
        let stopped_components: Vec<String> = inner
            .components
            .iter()
            .filter(|c| !c.is_running())
            .map(|c| c.name().to_string())
            .collect();
        let components_running = stopped_components.is_empty();

        let status = match &inner.fatal_error {
            Some(error) => format!("unhealthy: {error}"),
            None if !broker_connected => "unhealthy: broker disconnected".to_string(),
            None if !components_running => "unhealthy: components stopped".to_string(),
            None => "healthy".to_string(),
        };

        HealthStatus {
            status,
            broker_connected,
            components_running,
            stopped_components,
        }
    }
}

/// Health server for K8s probes.
pub struct HealthServer {
    port: u16,
    state: HealthState,
    metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl HealthServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            state: HealthState::new(),
            metrics_handle: None,
        }
    }

    /// Set the metrics handle for /metrics endpoint.
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Get the health state for updates.
    pub fn state(&self) -> HealthState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/readyz", get(ready_handler))
            .with_state(self.state.clone());

        if let Some(handle) = self.metrics_handle.clone() {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        router
    }

    /// Serve until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<(), std::io::Error> {
        let router = self.router();
        let addr = format!("0.0.0.0:{}", self.port);

        info!(addr = %addr, "Starting health server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Health server stopped");
        Ok(())
    }
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let status = state.status().await;
    if state.is_alive().await {
        (StatusCode::OK, Json(status))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status))
    }
}

async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let status = state.status().await;
    if state.is_ready().await {
        (StatusCode::OK, Json(status))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status))
    }
}
