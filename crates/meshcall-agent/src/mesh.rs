use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::client::connect::dns::Name;
use reqwest::dns::{Addrs, Resolve, Resolving};
use reqwest::Client;

use meshcall_core::identity::is_dns_label;
use meshcall_core::{CallError, CaRoots, DiscoveryBackend, LeafCertificate, TransportError};

use crate::agent_backend::error_chain;
use crate::tls::mesh_client_config;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// HTTPS client that presents a service's mesh certificate and only accepts
/// peers holding a mesh leaf for the service it asked for. Peers are addressed
/// as `<peer>.service.<domain>`.
#[derive(Debug, Clone)]
pub struct MeshClient {
    http: Client,
    service: String,
    domain: String,
}

impl MeshClient {
    pub fn build(
        leaf: &LeafCertificate,
        roots: &CaRoots,
        backend: Arc<dyn DiscoveryBackend>,
        domain: &str,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        if roots.is_empty() {
            return Err(TransportError::InvalidMaterial("no CA roots".to_string()));
        }
        let tls = mesh_client_config(leaf, roots, domain)?;

        let builder = Client::builder()
            .use_preconfigured_tls(tls)
            .https_only(true)
            .timeout(timeout)
            .dns_resolver(Arc::new(CatalogResolver::new(backend, domain)));
        let http = builder
            .build()
            .map_err(|e| TransportError::Client(error_chain(&e)))?;

        Ok(Self {
            http,
            service: leaf.service.clone(),
            domain: domain.to_string(),
        })
    }

    /// Name of the service whose certificate this client presents.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn peer_url(&self, peer: &str, path: &str) -> Result<String, CallError> {
        if !is_dns_label(peer) {
            return Err(CallError::InvalidPeer(peer.to_string()));
        }
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
        Ok(format!("https://{peer}.service.{}{path}", self.domain))
    }

    /// One GET; the body is read to the end before returning, on success and on error status.
    pub async fn get(&self, peer: &str, path: &str) -> Result<Vec<u8>, CallError> {
        let url = self.peer_url(peer, path)?;
        tracing::debug!(from = %self.service, %url, "mesh request");

        let mut res = self.http.get(&url).send().await.map_err(classify)?;
        let status = res.status();
        let mut body = Vec::new();
        while let Some(chunk) = res.chunk().await.map_err(classify)? {
            body.extend_from_slice(&chunk);
        }

        if !status.is_success() {
            return Err(CallError::Status { status: status.as_u16(), body });
        }
        Ok(body)
    }
}

fn classify(err: reqwest::Error) -> CallError {
    if err.is_timeout() {
        CallError::Timeout
    } else {
        CallError::Network(error_chain(&err))
    }
}

/// Resolves `<peer>.service.<domain>` through the discovery backend.
struct CatalogResolver {
    backend: Arc<dyn DiscoveryBackend>,
    suffix: String,
}

impl CatalogResolver {
    fn new(backend: Arc<dyn DiscoveryBackend>, domain: &str) -> Self {
        Self {
            backend,
            suffix: format!(".service.{}", domain.trim_end_matches('.')),
        }
    }
}

/// The peer label of a mesh host name, if it is one.
pub(crate) fn peer_from_host<'a>(host: &'a str, suffix: &str) -> Option<&'a str> {
    let host = host.trim_end_matches('.');
    let peer = host.strip_suffix(suffix)?;
    is_dns_label(peer).then_some(peer)
}

impl Resolve for CatalogResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let backend = self.backend.clone();
        let host = name.as_str().to_string();
        let peer = peer_from_host(&host, &self.suffix).map(str::to_string);

        Box::pin(async move {
            let peer = peer.ok_or_else(|| format!("{host} is not a mesh service name"))?;
            let instances = backend.query_service(&peer).await?;
            let addrs: Vec<SocketAddr> = instances.into_iter().filter_map(|i| i.address).collect();
            if addrs.is_empty() {
                return Err(format!("no addressable instances of {peer}").into());
            }
            tracing::debug!(%peer, ?addrs, "mesh name resolved");
            Ok::<Addrs, BoxError>(Box::new(addrs.into_iter()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_hosts_map_to_peer_labels() {
        let suffix = ".service.consul";
        assert_eq!(peer_from_host("service1.service.consul", suffix), Some("service1"));
        assert_eq!(peer_from_host("service1.service.consul.", suffix), Some("service1"));
        assert_eq!(peer_from_host("example.com", suffix), None);
        assert_eq!(peer_from_host("a.b.service.consul", suffix), None);
        assert_eq!(peer_from_host(".service.consul", suffix), None);
    }
}
