//! JSON bodies of the agent HTTP API.
//!
//! Field names follow the agent's PascalCase convention. Conversions to and
//! from the domain types live here so the client and the dev agent agree.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::certs::{CaRoots, LeafCertificate};
use crate::errors::BackendError;
use crate::health::HealthStatus;
use crate::identity::{HealthCheck, ServiceIdentity};
use crate::instance::ServiceInstance;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<AgentServiceCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct AgentServiceCheck {
    #[serde(rename = "HTTP")]
    pub http: String,
    pub interval: String,
    #[serde(rename = "TLSSkipVerify", default)]
    pub tls_skip_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<HealthStatus>,
}

impl From<&ServiceIdentity> for AgentServiceRegistration {
    fn from(identity: &ServiceIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
            address: identity.address.map(|a| a.ip().to_string()),
            port: identity.address.map(|a| a.port()),
            check: identity.check.as_ref().map(|check| AgentServiceCheck {
                http: check.http.clone(),
                interval: format_interval(check.interval),
                tls_skip_verify: check.tls_skip_verify,
                status: check.status,
            }),
        }
    }
}

impl AgentServiceRegistration {
    pub fn into_identity(self) -> Result<ServiceIdentity, BackendError> {
        let address = socket_addr(self.address.as_deref(), self.port)?;
        let check = match self.check {
            Some(check) => Some(HealthCheck {
                interval: parse_interval(&check.interval)?,
                http: check.http,
                tls_skip_verify: check.tls_skip_verify,
                status: check.status,
            }),
            None => None,
        };
        let id = if self.id.is_empty() { self.name.clone() } else { self.id };
        Ok(ServiceIdentity { name: self.name, id, address, check })
    }
}

/// One element of `GET /v1/health/service/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<AgentNode>,
    pub service: AgentService,
    #[serde(default)]
    pub checks: Vec<HealthCheckEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentNode {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheckEntry {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    #[serde(rename = "ServiceID", default)]
    pub service_id: String,
    pub status: HealthStatus,
}

impl From<&ServiceInstance> for ServiceEntry {
    fn from(instance: &ServiceInstance) -> Self {
        Self {
            node: None,
            service: AgentService {
                id: instance.id.clone(),
                service: instance.service.clone(),
                address: instance.address.map(|a| a.ip().to_string()).unwrap_or_default(),
                port: instance.address.map(|a| a.port()).unwrap_or_default(),
            },
            checks: vec![HealthCheckEntry {
                check_id: check_id(&instance.id),
                service_id: instance.id.clone(),
                status: instance.health,
            }],
        }
    }
}

impl ServiceEntry {
    /// The worst check status wins; an entry without checks is passing.
    /// An empty service address means the node's address, as the agent defines it.
    /// Addresses that are not IP literals are `Malformed`.
    pub fn into_instance(self) -> Result<ServiceInstance, BackendError> {
        let health = self
            .checks
            .iter()
            .map(|c| c.status)
            .max_by_key(|status| match status {
                HealthStatus::Passing => 0,
                HealthStatus::Warning => 1,
                HealthStatus::Critical => 2,
            })
            .unwrap_or(HealthStatus::Passing);
        let host = match self.service.address.as_str() {
            "" => self.node.as_ref().map(|n| n.address.as_str()).unwrap_or_default(),
            address => address,
        };
        let address = if host.is_empty() || self.service.port == 0 {
            None
        } else {
            socket_addr(Some(host), Some(self.service.port))?
        };
        Ok(ServiceInstance {
            id: self.service.id,
            service: self.service.service,
            address,
            health,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CaRootList {
    #[serde(rename = "ActiveRootID", default)]
    pub active_root_id: String,
    #[serde(default)]
    pub trust_domain: String,
    #[serde(default)]
    pub roots: Vec<CaRoot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CaRoot {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub root_cert: String,
    #[serde(default)]
    pub active: bool,
}

impl From<&CaRoots> for CaRootList {
    fn from(roots: &CaRoots) -> Self {
        let list: Vec<CaRoot> = roots
            .roots
            .iter()
            .enumerate()
            .map(|(idx, pem)| CaRoot {
                id: format!("root-{idx}"),
                name: format!("{} CA {idx}", roots.trust_domain),
                root_cert: pem.clone(),
                active: true,
            })
            .collect();
        Self {
            active_root_id: list.first().map(|r| r.id.clone()).unwrap_or_default(),
            trust_domain: roots.trust_domain.clone(),
            roots: list,
        }
    }
}

impl From<CaRootList> for CaRoots {
    /// Only active roots are trusted.
    fn from(list: CaRootList) -> Self {
        CaRoots {
            trust_domain: list.trust_domain,
            roots: list.roots.into_iter().filter(|r| r.active).map(|r| r.root_cert).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LeafCert {
    pub service: String,
    #[serde(rename = "ServiceURI", default)]
    pub service_uri: String,
    #[serde(rename = "CertPEM")]
    pub cert_pem: String,
    #[serde(rename = "PrivateKeyPEM")]
    pub private_key_pem: String,
}

impl From<&LeafCertificate> for LeafCert {
    fn from(leaf: &LeafCertificate) -> Self {
        Self {
            service: leaf.service.clone(),
            service_uri: String::new(),
            cert_pem: leaf.cert_pem.clone(),
            private_key_pem: leaf.private_key_pem.clone(),
        }
    }
}

impl From<LeafCert> for LeafCertificate {
    fn from(leaf: LeafCert) -> Self {
        LeafCertificate::new(leaf.service, leaf.cert_pem, leaf.private_key_pem)
    }
}

/// Check id the agent assigns to a service's own check.
pub fn check_id(service_id: &str) -> String {
    format!("service:{service_id}")
}

/// Agent-style duration string: `5s`, `1500ms`.
pub fn format_interval(interval: Duration) -> String {
    if interval.subsec_millis() == 0 {
        format!("{}s", interval.as_secs())
    } else {
        format!("{}ms", interval.as_millis())
    }
}

pub fn parse_interval(raw: &str) -> Result<Duration, BackendError> {
    let raw = raw.trim();
    let invalid = || BackendError::Malformed(format!("invalid interval {raw:?}"));
    let (digits, unit) = raw.split_at(raw.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?);
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let seconds = |scale: u64| {
        value
            .checked_mul(scale)
            .map(Duration::from_secs)
            .ok_or_else(|| BackendError::Malformed(format!("interval {raw:?} is out of range")))
    };
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => seconds(1),
        "m" => seconds(60),
        "h" => seconds(3600),
        _ => Err(invalid()),
    }
}

fn socket_addr(address: Option<&str>, port: Option<u16>) -> Result<Option<SocketAddr>, BackendError> {
    match (address, port) {
        (Some(address), Some(port)) if !address.is_empty() => {
            let ip: IpAddr = address
                .parse()
                .map_err(|_| BackendError::Malformed(format!("invalid address {address:?}")))?;
            Ok(Some(SocketAddr::new(ip, port)))
        }
        _ => Ok(None),
    }
}
