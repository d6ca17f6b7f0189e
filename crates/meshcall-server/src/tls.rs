use std::io::BufReader;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use rustls_pemfile::Item;
use thiserror::Error;

use meshcall_core::{CaRoots, LeafCertificate};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unreadable PEM: {0}")]
    Pem(#[from] std::io::Error),

    #[error("no certificate in leaf PEM for {0}")]
    NoCertificate(String),

    #[error("no private key in leaf PEM for {0}")]
    NoPrivateKey(String),

    #[error("no usable CA root")]
    NoRoots,

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Server side of the mesh: present the service's leaf, demand a client
/// certificate chaining to one of the mesh roots.
pub fn mesh_server_config(leaf: &LeafCertificate, roots: &CaRoots) -> Result<ServerConfig, TlsError> {
    let chain: Vec<Certificate> = rustls_pemfile::certs(&mut BufReader::new(leaf.cert_pem.as_bytes()))?
        .into_iter()
        .map(Certificate)
        .collect();
    if chain.is_empty() {
        return Err(TlsError::NoCertificate(leaf.service.clone()));
    }

    let key = rustls_pemfile::read_all(&mut BufReader::new(leaf.private_key_pem.as_bytes()))?
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| TlsError::NoPrivateKey(leaf.service.clone()))?;

    let mut store = RootCertStore::empty();
    for pem in &roots.roots {
        let ders = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))?;
        let (added, ignored) = store.add_parsable_certificates(&ders);
        if ignored > 0 {
            tracing::warn!(added, ignored, "skipped unparsable CA roots");
        }
    }
    if store.is_empty() {
        return Err(TlsError::NoRoots);
    }

    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(store).boxed())
        .with_single_cert(chain, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

pub fn mesh_tls_config(leaf: &LeafCertificate, roots: &CaRoots) -> Result<RustlsConfig, TlsError> {
    Ok(RustlsConfig::from_config(Arc::new(mesh_server_config(leaf, roots)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../fixtures/certs/ca.pem"));
    const CERT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../fixtures/certs/service1.pem"));
    const KEY: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../fixtures/certs/service1-key.pem"));

    fn roots() -> CaRoots {
        CaRoots::new("consul", vec![CA.to_string()])
    }

    #[test]
    fn builds_from_mesh_material() {
        let config = mesh_server_config(&LeafCertificate::new("service1", CERT, KEY), &roots()).unwrap();
        assert_eq!(config.alpn_protocols.len(), 2);
    }

    #[test]
    fn missing_key_is_reported() {
        let err = mesh_server_config(&LeafCertificate::new("service1", CERT, ""), &roots()).unwrap_err();
        assert!(matches!(err, TlsError::NoPrivateKey(name) if name == "service1"));
    }

    #[test]
    fn missing_certificate_is_reported() {
        let err = mesh_server_config(&LeafCertificate::new("service1", "", KEY), &roots()).unwrap_err();
        assert!(matches!(err, TlsError::NoCertificate(_)));
    }

    #[test]
    fn roots_are_required() {
        let leaf = LeafCertificate::new("service1", CERT, KEY);
        let err = mesh_server_config(&leaf, &CaRoots::default()).unwrap_err();
        assert!(matches!(err, TlsError::NoRoots));
    }
}
