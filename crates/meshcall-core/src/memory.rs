use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::backend::DiscoveryBackend;
use crate::certs::{CaRoots, LeafCertificate};
use crate::errors::BackendError;
use crate::health::HealthStatus;
use crate::identity::{HealthCheck, ServiceIdentity};
use crate::instance::ServiceInstance;

/// In-process catalog with no propagation delay.
///
/// Certificate material is provisioned up front; nothing is issued here.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    instances: RwLock<BTreeMap<String, ServiceInstance>>,
    checks: RwLock<HashMap<String, HealthCheck>>,
    leaves: RwLock<HashMap<String, LeafCertificate>>,
    roots: RwLock<CaRoots>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ca_roots(self, roots: CaRoots) -> Self {
        *write(&self.roots) = roots;
        self
    }

    pub fn with_leaf(self, leaf: LeafCertificate) -> Self {
        write(&self.leaves).insert(leaf.service.clone(), leaf);
        self
    }

    /// Adds the identity; an id that is already present is rejected.
    pub fn register(&self, identity: &ServiceIdentity) -> Result<ServiceInstance, BackendError> {
        if let Err(err) = identity.validate() {
            return Err(BackendError::Rejected { status: 400, message: err.to_string() });
        }
        let mut instances = write(&self.instances);
        if instances.contains_key(&identity.id) {
            return Err(BackendError::Rejected {
                status: 409,
                message: format!("service id {} is already registered", identity.id),
            });
        }
        let instance = ServiceInstance::from_identity(identity);
        instances.insert(identity.id.clone(), instance.clone());
        if let Some(check) = &identity.check {
            write(&self.checks).insert(identity.id.clone(), check.clone());
        }
        tracing::debug!(id = %identity.id, service = %identity.name, "catalog entry added");
        Ok(instance)
    }

    /// Returns whether an entry was removed.
    pub fn deregister(&self, service_id: &str) -> bool {
        let removed = write(&self.instances).remove(service_id).is_some();
        write(&self.checks).remove(service_id);
        tracing::debug!(id = %service_id, removed, "catalog entry removed");
        removed
    }

    pub fn instances(&self, service: &str, passing_only: bool) -> Vec<ServiceInstance> {
        read(&self.instances)
            .values()
            .filter(|i| i.service == service)
            .filter(|i| !passing_only || i.health.is_passing())
            .cloned()
            .collect()
    }

    pub fn all_instances(&self) -> Vec<ServiceInstance> {
        read(&self.instances).values().cloned().collect()
    }

    /// Instances that registered a health check, paired with it.
    pub fn checked_instances(&self) -> Vec<(ServiceInstance, HealthCheck)> {
        let instances = read(&self.instances);
        read(&self.checks)
            .iter()
            .filter_map(|(id, check)| Some((instances.get(id)?.clone(), check.clone())))
            .collect()
    }

    pub fn contains(&self, service_id: &str) -> bool {
        read(&self.instances).contains_key(service_id)
    }

    pub fn set_health(&self, service_id: &str, health: HealthStatus) -> Result<(), BackendError> {
        let mut instances = write(&self.instances);
        let instance = instances
            .get_mut(service_id)
            .ok_or_else(|| BackendError::NotFound(format!("service id {service_id}")))?;
        instance.set_health(health);
        Ok(())
    }

    pub fn roots(&self) -> CaRoots {
        read(&self.roots).clone()
    }

    pub fn leaf(&self, service: &str) -> Result<LeafCertificate, BackendError> {
        read(&self.leaves)
            .get(service)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("no leaf certificate for {service}")))
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryCatalog {
    async fn register_service(&self, identity: &ServiceIdentity) -> Result<(), BackendError> {
        self.register(identity).map(|_| ())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<(), BackendError> {
        self.deregister(service_id);
        Ok(())
    }

    async fn query_service(&self, name: &str) -> Result<Vec<ServiceInstance>, BackendError> {
        Ok(self.instances(name, true))
    }

    async fn ca_roots(&self) -> Result<CaRoots, BackendError> {
        let roots = self.roots();
        if roots.is_empty() {
            return Err(BackendError::NotFound("no CA roots provisioned".to_string()));
        }
        Ok(roots)
    }

    async fn leaf_certificate(&self, service: &str) -> Result<LeafCertificate, BackendError> {
        self.leaf(service)
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
