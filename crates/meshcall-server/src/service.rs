use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct ServiceState {
    name: Arc<str>,
}

/// Router of the service role: a greeting on `/` and a liveness probe on `/health`.
pub fn hello_router(name: &str) -> Router {
    let state = ServiceState { name: Arc::from(name) };

    Router::new()
        .route("/", get(hello))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Plain-HTTP `/health` for the agent's checks, which carry no mesh certificate.
pub fn health_router() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
}

/// Adds `/metrics` in the Prometheus text format.
pub fn with_metrics(router: Router, handle: PrometheusHandle) -> Router {
    router.route(
        "/metrics",
        get(move || {
            let rendered = handle.render();
            async move { rendered }
        }),
    )
}

async fn hello(State(state): State<ServiceState>) -> impl IntoResponse {
    metrics::counter!("meshcall_requests_served_total").increment(1);
    format!("Hello from {}!", state.name)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
