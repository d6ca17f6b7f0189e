use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

use meshcall_core::wire::{AgentServiceRegistration, CaRootList, LeafCert, ServiceEntry};
use meshcall_core::{
    BackendError, CaRoots, DiscoveryBackend, LeafCertificate, ServiceIdentity, ServiceInstance,
};

use crate::config::AgentConfig;

/// `DiscoveryBackend` backed by the local agent's HTTP API.
#[derive(Debug, Clone)]
pub struct AgentBackend {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl AgentBackend {
    pub fn new(config: &AgentConfig) -> Result<Self, BackendError> {
        let base = Url::parse(&config.address)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| BackendError::Unreachable(format!("invalid agent address {:?}", config.address)))?;
        let client = Client::builder()
            .timeout(config.agent_timeout)
            .build()
            .map_err(|e| BackendError::Unreachable(format!("cannot build agent client: {e}")))?;
        Ok(Self {
            client,
            base,
            token: config.token.clone(),
        })
    }

    /// Each segment is percent-encoded, so names cannot smuggle in a query or another path.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, BackendError> {
        let res = builder
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(error_chain(&e)))?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let message = res.text().await.unwrap_or_default().trim().to_string();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(message));
        }
        Err(BackendError::Rejected { status: status.as_u16(), message })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, BackendError> {
        let path = url.path().to_string();
        let res = self.send(self.request(Method::GET, url)).await?;
        res.json::<T>()
            .await
            .map_err(|e| BackendError::Malformed(format!("{path}: {e}")))
    }
}

#[async_trait]
impl DiscoveryBackend for AgentBackend {
    async fn register_service(&self, identity: &ServiceIdentity) -> Result<(), BackendError> {
        let body = AgentServiceRegistration::from(identity);
        let url = self.url(&["v1", "agent", "service", "register"]);
        self.send(self.request(Method::PUT, url).json(&body)).await?;
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<(), BackendError> {
        let url = self.url(&["v1", "agent", "service", "deregister", service_id]);
        match self.send(self.request(Method::PUT, url)).await {
            Ok(_) => Ok(()),
            Err(BackendError::NotFound(message)) => {
                tracing::debug!(id = %service_id, %message, "service already absent from agent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Entries the client cannot use (hostname addresses) are skipped, not fatal.
    async fn query_service(&self, name: &str) -> Result<Vec<ServiceInstance>, BackendError> {
        let mut url = self.url(&["v1", "health", "service", name]);
        url.query_pairs_mut().append_pair("passing", "true");
        let entries: Vec<ServiceEntry> = self.get_json(url).await?;

        let mut instances = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = entry.service.id.clone();
            match entry.into_instance() {
                Ok(instance) => instances.push(instance),
                Err(e) => tracing::warn!(service = %name, %id, error = %e, "skipping unusable catalog entry"),
            }
        }
        Ok(instances)
    }

    async fn ca_roots(&self) -> Result<CaRoots, BackendError> {
        let list: CaRootList = self.get_json(self.url(&["v1", "agent", "connect", "ca", "roots"])).await?;
        Ok(list.into())
    }

    async fn leaf_certificate(&self, service: &str) -> Result<LeafCertificate, BackendError> {
        let leaf: LeafCert = self
            .get_json(self.url(&["v1", "agent", "connect", "ca", "leaf", service]))
            .await?;
        Ok(leaf.into())
    }
}

/// `reqwest` hides the interesting part of an error in its source chain.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query},
        http::{HeaderMap, StatusCode},
        routing::{get, put},
        Json, Router,
    };
    use std::collections::HashMap;
    use std::net::{SocketAddr, TcpListener};

    async fn spawn(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });
        addr
    }

    fn backend(addr: SocketAddr, token: Option<&str>) -> AgentBackend {
        AgentBackend::new(&AgentConfig {
            address: format!("http://{addr}/"),
            token: token.map(str::to_string),
            ..AgentConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn health_query_asks_for_passing_entries() {
        let app = Router::new().route(
            "/v1/health/service/:name",
            get(|Path(name): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("passing").map(String::as_str), Some("true"));
                Json(serde_json::json!([{
                    "Service": { "ID": format!("{name}-1"), "Service": name, "Address": "127.0.0.1", "Port": 8080 },
                    "Checks": [{ "CheckID": "serfHealth", "Status": "passing" }]
                }]))
            }),
        );
        let addr = spawn(app).await;

        let instances = backend(addr, None).query_service("service1").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "service1-1");
        assert_eq!(instances[0].address, Some("127.0.0.1:8080".parse().unwrap()));
    }

    #[tokio::test]
    async fn service_names_cannot_rewrite_the_query() {
        let app = Router::new().route(
            "/v1/health/service/:name",
            get(|Path(name): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(name, "service1?passing=false#");
                assert_eq!(q.get("passing").map(String::as_str), Some("true"));
                Json(serde_json::json!([]))
            }),
        );
        let addr = spawn(app).await;

        let instances = backend(addr, None).query_service("service1?passing=false#").await.unwrap();
        assert!(instances.is_empty());
    }

    #[tokio::test]
    async fn unusable_entries_do_not_hide_usable_ones() {
        let app = Router::new().route(
            "/v1/health/service/:name",
            get(|| async {
                Json(serde_json::json!([
                    {
                        "Node": { "Node": "node-a", "Address": "10.0.0.1" },
                        "Service": { "ID": "web-a", "Service": "web", "Address": "127.0.0.1", "Port": 8080 }
                    },
                    {
                        "Node": { "Node": "node-b", "Address": "10.0.0.2" },
                        "Service": { "ID": "web-b", "Service": "web", "Address": "web-b.node.consul", "Port": 8080 }
                    },
                    {
                        "Node": { "Node": "node-c", "Address": "10.0.0.3" },
                        "Service": { "ID": "web-c", "Service": "web", "Address": "", "Port": 8081 }
                    }
                ]))
            }),
        );
        let addr = spawn(app).await;

        let instances = backend(addr, None).query_service("web").await.unwrap();
        let found: Vec<_> = instances.iter().map(|i| (i.id.as_str(), i.address)).collect();
        assert_eq!(
            found,
            vec![
                ("web-a", Some("127.0.0.1:8080".parse().unwrap())),
                ("web-c", Some("10.0.0.3:8081".parse().unwrap())),
            ]
        );
    }

    #[test]
    fn agent_address_must_be_a_url() {
        let config = AgentConfig { address: "not a url".to_string(), ..AgentConfig::default() };
        assert!(matches!(AgentBackend::new(&config), Err(BackendError::Unreachable(_))));
    }

    #[tokio::test]
    async fn token_is_sent_as_bearer() {
        let app = Router::new().route(
            "/v1/agent/service/register",
            put(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["Name"], "service2");
                match headers.get("authorization").and_then(|h| h.to_str().ok()) {
                    Some("Bearer s3cret") => StatusCode::OK,
                    _ => StatusCode::FORBIDDEN,
                }
            }),
        );
        let addr = spawn(app).await;

        let identity = ServiceIdentity::new("service2");
        backend(addr, Some("s3cret")).register_service(&identity).await.unwrap();
        let err = backend(addr, None).register_service(&identity).await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn deregistering_an_unknown_id_succeeds() {
        let app = Router::new().route(
            "/v1/agent/service/deregister/:id",
            put(|Path(id): Path<String>| async move {
                (StatusCode::NOT_FOUND, format!("Unknown service ID {id:?}"))
            }),
        );
        let addr = spawn(app).await;

        backend(addr, None).deregister_service("service2").await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_agent_is_reported_as_such() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let err = backend(addr, None).query_service("service1").await.unwrap_err();
        assert!(matches!(err, BackendError::Unreachable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn garbage_bodies_are_malformed() {
        let app = Router::new().route("/v1/agent/connect/ca/roots", get(|| async { "not json" }));
        let addr = spawn(app).await;

        let err = backend(addr, None).ca_roots().await.unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
    }
}
