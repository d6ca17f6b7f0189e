//! Client side of mesh TLS.
//!
//! Peers are authenticated by the SPIFFE service URI in their leaf, the way
//! agent-issued certificates identify a service. The host name is only used to
//! learn which service was asked for.

use std::io::BufReader;
use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{verify_server_cert_signed_by_trust_anchor, ServerCertVerified, ServerCertVerifier};
use rustls::server::ParsedCertificate;
use rustls::{Certificate, CertificateError, ClientConfig, Error, PrivateKey, RootCertStore, ServerName};
use rustls_pemfile::Item;
use x509_parser::extensions::GeneralName;

use meshcall_core::{CaRoots, LeafCertificate, TransportError};

use crate::mesh::peer_from_host;

/// rustls client config presenting `leaf` and accepting only peers whose leaf
/// chains to `roots` and names the requested service.
pub fn mesh_client_config(
    leaf: &LeafCertificate,
    roots: &CaRoots,
    domain: &str,
) -> Result<ClientConfig, TransportError> {
    let chain = leaf_chain(leaf)?;
    let key = leaf_key(leaf)?;

    let mut store = RootCertStore::empty();
    for pem in &roots.roots {
        let ders = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
            .map_err(|e| TransportError::InvalidMaterial(format!("CA root: {e}")))?;
        store.add_parsable_certificates(&ders);
    }
    if store.is_empty() {
        return Err(TransportError::InvalidMaterial("no usable CA roots".to_string()));
    }

    let verifier = SpiffeVerifier {
        roots: store,
        suffix: format!(".service.{}", domain.trim_end_matches('.')),
    };
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(chain, key)
        .map_err(|e| TransportError::InvalidMaterial(format!("leaf for {}: {e}", leaf.service)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn leaf_chain(leaf: &LeafCertificate) -> Result<Vec<Certificate>, TransportError> {
    let chain: Vec<Certificate> = rustls_pemfile::certs(&mut BufReader::new(leaf.cert_pem.as_bytes()))
        .map_err(|e| TransportError::InvalidMaterial(format!("leaf for {}: {e}", leaf.service)))?
        .into_iter()
        .map(Certificate)
        .collect();
    if chain.is_empty() {
        return Err(TransportError::InvalidMaterial(format!("no certificate in leaf for {}", leaf.service)));
    }
    Ok(chain)
}

fn leaf_key(leaf: &LeafCertificate) -> Result<PrivateKey, TransportError> {
    rustls_pemfile::read_all(&mut BufReader::new(leaf.private_key_pem.as_bytes()))
        .map_err(|e| TransportError::InvalidMaterial(format!("key for {}: {e}", leaf.service)))?
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| TransportError::InvalidMaterial(format!("no private key in leaf for {}", leaf.service)))
}

struct SpiffeVerifier {
    roots: RootCertStore,
    suffix: String,
}

impl ServerCertVerifier for SpiffeVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, Error> {
        let peer = match server_name {
            ServerName::DnsName(name) => peer_from_host(name.as_ref(), &self.suffix),
            _ => None,
        }
        .ok_or_else(|| Error::General(format!("{server_name:?} is not a mesh service name")))?;

        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(&cert, &self.roots, intermediates, now)?;

        let uris = uri_sans(&end_entity.0)?;
        if uris.iter().any(|uri| spiffe_service(uri) == Some(peer)) {
            return Ok(ServerCertVerified::assertion());
        }
        tracing::warn!(%peer, presented = ?uris, "peer certificate names another service");
        Err(Error::InvalidCertificate(CertificateError::NotValidForName))
    }
}

fn uri_sans(der: &[u8]) -> Result<Vec<String>, Error> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|_| Error::InvalidCertificate(CertificateError::BadEncoding))?;
    let san = cert
        .subject_alternative_name()
        .map_err(|_| Error::InvalidCertificate(CertificateError::BadEncoding))?;
    Ok(san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::URI(uri) => Some(uri.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}

/// Service named by `spiffe://<trust-domain>/ns/<ns>/dc/<dc>/svc/<service>`.
pub(crate) fn spiffe_service(uri: &str) -> Option<&str> {
    let (_, path) = uri.strip_prefix("spiffe://")?.split_once('/')?;
    let mut segments = path.split('/');
    while let Some(segment) = segments.next() {
        if segment == "svc" {
            let service = segments.next()?;
            return (segments.next().is_none() && !service.is_empty()).then_some(service);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_is_read_from_the_spiffe_path() {
        assert_eq!(
            spiffe_service("spiffe://mesh.consul/ns/default/dc/dc1/svc/service1"),
            Some("service1")
        );
        assert_eq!(spiffe_service("spiffe://mesh.consul/svc/web"), Some("web"));
        assert_eq!(spiffe_service("spiffe://mesh.consul/ns/default/dc/dc1/svc/"), None);
        assert_eq!(spiffe_service("spiffe://mesh.consul/ns/default/dc/dc1/svc/a/b"), None);
        assert_eq!(spiffe_service("spiffe://mesh.consul/agent/client/dc/dc1/id/x"), None);
        assert_eq!(spiffe_service("https://mesh.consul/svc/service1"), None);
    }

    #[test]
    fn fixture_leaf_carries_its_service_uri() {
        let pem = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../fixtures/certs/service1.pem"));
        let der = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes())).unwrap().remove(0);
        let uris = uri_sans(&der).unwrap();
        assert!(uris.iter().any(|uri| spiffe_service(uri) == Some("service1")), "{uris:?}");
    }
}
