//! Health and Prometheus endpoints for the binary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::metrics_consts::{HTTP_REQUESTS_COUNTER, HTTP_REQUEST_DURATION_HISTOGRAM};

/// Flipped by the binary while a pipeline is running
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

pub async fn index() -> &'static str {
    "kafka pipeline"
}

async fn liveness() -> &'static str {
    "ok"
}

async fn readiness(State(health): State<HealthState>) -> impl IntoResponse {
    if health.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Routes without the metrics endpoint
pub fn router(health: HealthState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(liveness))
        .with_state(health)
}

/// Mount `/metrics` and time every request. Call after all other routes are added.
pub fn setup_metrics_routes(router: Router, prometheus: PrometheusHandle) -> Router {
    let render = move || {
        let body = prometheus.render();
        async move { body }
    };
    router
        .route("/metrics", get(render))
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Install the global prometheus recorder. Fails when one is already installed.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Seconds; poll, commit and send latencies share these
    const LATENCY_BUCKETS: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];

    let builder = PrometheusBuilder::new().set_buckets(LATENCY_BUCKETS)?;
    builder.install_recorder()
}

/// Serve until `shutdown` fires
pub async fn serve(router: Router, bind: &str, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Route template when one matched, so ids in paths don't explode label cardinality
fn route_label(req: &Request<Body>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map_or_else(|| req.uri().path(), MatchedPath::as_str)
        .to_string()
}

async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let route = route_label(&req);
    let method = req.method().as_str().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS_COUNTER, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_HISTOGRAM, &labels)
        .record(started.elapsed().as_secs_f64());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get_status(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response.lines().next().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_readiness_follows_health_state() {
        let health = HealthState::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(health.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        assert!(get_status(addr, "/_liveness").await.contains("200"));
        assert!(get_status(addr, "/_readiness").await.contains("503"));

        health.set_ready(true);
        assert!(get_status(addr, "/_readiness").await.contains("200"));
    }
}
