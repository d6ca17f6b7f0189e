//! Development agent: the agent HTTP API served over an in-memory catalog.
//!
//! Enough of the real agent's surface for the client role to run against
//! locally and in tests. Certificates are whatever the catalog was provisioned
//! with; nothing is issued or rotated here.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use meshcall_core::wire::{AgentServiceRegistration, CaRootList, LeafCert, ServiceEntry};
use meshcall_core::{BackendError, HealthStatus, MemoryCatalog};

#[derive(Clone)]
struct AgentState {
    catalog: Arc<MemoryCatalog>,
    token: Option<Arc<str>>,
}

/// Router for the dev agent. With a `token`, every request must present it as a bearer token.
pub fn agent_router(catalog: Arc<MemoryCatalog>, token: Option<String>) -> Router {
    let state = AgentState {
        catalog,
        token: token.map(Arc::from),
    };

    Router::new()
        .route("/v1/agent/service/register", put(register_service))
        .route("/v1/agent/service/deregister/:id", put(deregister_service))
        .route("/v1/health/service/:name", get(health_service))
        .route("/v1/agent/connect/ca/roots", get(ca_roots))
        .route("/v1/agent/connect/ca/leaf/:service", get(leaf_certificate))
        .route("/v1/agent/check/pass/:check_id", put(check_pass))
        .route("/v1/agent/check/warn/:check_id", put(check_warn))
        .route("/v1/agent/check/fail/:check_id", put(check_fail))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn register_service(
    State(state): State<AgentState>,
    Json(payload): Json<AgentServiceRegistration>,
) -> Response {
    let identity = match payload.into_identity() {
        Ok(identity) => identity,
        Err(e) => return backend_error(e),
    };
    match state.catalog.register(&identity) {
        Ok(instance) => {
            tracing::info!(id = %instance.id, service = %instance.service, health = %instance.health, "service registered");
            StatusCode::OK.into_response()
        }
        Err(e) => backend_error(e),
    }
}

async fn deregister_service(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Response {
    if state.catalog.deregister(&id) {
        tracing::info!(%id, "service deregistered");
        StatusCode::OK.into_response()
    } else {
        (StatusCode::NOT_FOUND, format!("Unknown service ID {id:?}")).into_response()
    }
}

async fn health_service(
    State(state): State<AgentState>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    // `?passing` and `?passing=true` both filter.
    let passing_only = query.get("passing").is_some_and(|v| v != "false");
    let entries: Vec<ServiceEntry> = state
        .catalog
        .instances(&name, passing_only)
        .iter()
        .map(ServiceEntry::from)
        .collect();
    (StatusCode::OK, Json(entries)).into_response()
}

async fn ca_roots(State(state): State<AgentState>) -> Response {
    let roots = state.catalog.roots();
    if roots.is_empty() {
        return (StatusCode::NOT_FOUND, "Connect CA not configured").into_response();
    }
    (StatusCode::OK, Json(CaRootList::from(&roots))).into_response()
}

async fn leaf_certificate(
    State(state): State<AgentState>,
    Path(service): Path<String>,
) -> Response {
    match state.catalog.leaf(&service) {
        Ok(leaf) => (StatusCode::OK, Json(LeafCert::from(&leaf))).into_response(),
        Err(e) => backend_error(e),
    }
}

async fn check_pass(state: State<AgentState>, check_id: Path<String>) -> Response {
    update_check(state, check_id, HealthStatus::Passing)
}

async fn check_warn(state: State<AgentState>, check_id: Path<String>) -> Response {
    update_check(state, check_id, HealthStatus::Warning)
}

async fn check_fail(state: State<AgentState>, check_id: Path<String>) -> Response {
    update_check(state, check_id, HealthStatus::Critical)
}

fn update_check(
    State(state): State<AgentState>,
    Path(check_id): Path<String>,
    health: HealthStatus,
) -> Response {
    let Some(service_id) = check_id.strip_prefix("service:") else {
        return (StatusCode::NOT_FOUND, format!("Unknown check {check_id:?}")).into_response();
    };
    match state.catalog.set_health(service_id, health) {
        Ok(()) => {
            tracing::info!(id = %service_id, %health, "check updated");
            StatusCode::OK.into_response()
        }
        Err(e) => backend_error(e),
    }
}

fn backend_error(err: BackendError) -> Response {
    match err {
        BackendError::Rejected { status, message } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
            (status, message).into_response()
        }
        BackendError::NotFound(message) => (StatusCode::NOT_FOUND, message).into_response(),
        BackendError::Malformed(message) => (StatusCode::BAD_REQUEST, message).into_response(),
        BackendError::Unreachable(message) => (StatusCode::SERVICE_UNAVAILABLE, message).into_response(),
    }
}

async fn auth_middleware<B>(
    State(state): State<AgentState>,
    req: Request<B>,
    next: Next<B>,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.token.as_deref() else {
        return Ok(next.run(req).await);
    };

    let presented = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => Ok(next.run(req).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use meshcall_core::ServiceIdentity;
    use tower::ServiceExt;

    fn request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn token_is_enforced_when_configured() {
        let app = agent_router(Arc::new(MemoryCatalog::new()), Some("s3cret".to_string()));

        let res = app.clone().oneshot(request("GET", "/v1/health/service/web", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app.clone().oneshot(request("GET", "/v1/health/service/web", Some("wrong"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app.oneshot(request("GET", "/v1/health/service/web", Some("s3cret"))).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn deregistering_an_unknown_id_is_not_found() {
        let app = agent_router(Arc::new(MemoryCatalog::new()), None);
        let res = app.oneshot(request("PUT", "/v1/agent/service/deregister/ghost", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn check_updates_flip_instance_health() {
        let catalog = Arc::new(MemoryCatalog::new());
        let check = meshcall_core::HealthCheck::http("https://127.0.0.1:8080/health", std::time::Duration::from_secs(5));
        catalog
            .register(&ServiceIdentity::new("web").with_address("127.0.0.1:8080".parse().unwrap()).with_check(check))
            .unwrap();
        let app = agent_router(catalog.clone(), None);

        let res = app.clone().oneshot(request("PUT", "/v1/agent/check/pass/service:web", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(catalog.instances("web", true).len(), 1);

        let res = app.clone().oneshot(request("PUT", "/v1/agent/check/fail/service:web", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(catalog.instances("web", true).is_empty());

        let res = app.oneshot(request("PUT", "/v1/agent/check/pass/serfHealth", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_ca_is_not_found() {
        let app = agent_router(Arc::new(MemoryCatalog::new()), None);
        let res = app.oneshot(request("GET", "/v1/agent/connect/ca/roots", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
