use std::net::SocketAddr;
use serde::{Deserialize, Serialize};

use crate::health::HealthStatus;
use crate::identity::ServiceIdentity;

/// One entry of the backend catalog, as seen through a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub service: String,
    /// `None` for registrations that did not advertise an address.
    pub address: Option<SocketAddr>,
    pub health: HealthStatus,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, service: impl Into<String>, address: Option<SocketAddr>) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            address,
            health: HealthStatus::Passing,
        }
    }

    /// Initial catalog entry for a fresh registration.
    pub fn from_identity(identity: &ServiceIdentity) -> Self {
        let health = match &identity.check {
            None => HealthStatus::Passing,
            Some(check) => check.status.unwrap_or(HealthStatus::Critical),
        };
        Self {
            id: identity.id.clone(),
            service: identity.name.clone(),
            address: identity.address,
            health,
        }
    }

    pub fn set_health(&mut self, health: HealthStatus) {
        self.health = health;
    }
}
