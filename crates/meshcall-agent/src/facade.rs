use std::sync::Arc;
use std::time::Duration;

use meshcall_core::identity::is_dns_label;
use meshcall_core::{
    BackendError, CallError, DeregistrationError, DiscoveryBackend, RegistrationError,
    ResolutionError, ServiceIdentity, ServiceInstance, TransportError,
};

use crate::agent_backend::AgentBackend;
use crate::config::{AgentConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_MESH_DOMAIN};
use crate::mesh::MeshClient;

/// Register, resolve, secure, call, deregister: the whole client surface of the mesh.
#[derive(Clone)]
pub struct MeshFacade {
    backend: Arc<dyn DiscoveryBackend>,
    mesh_domain: String,
    call_timeout: Duration,
}

impl MeshFacade {
    pub fn new(backend: Arc<dyn DiscoveryBackend>) -> Self {
        Self {
            backend,
            mesh_domain: DEFAULT_MESH_DOMAIN.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Facade over the agent named by `config`.
    pub fn from_config(config: &AgentConfig) -> Result<Self, BackendError> {
        let backend = AgentBackend::new(config)?;
        Ok(Self::new(Arc::new(backend))
            .with_mesh_domain(config.mesh_domain.clone())
            .with_call_timeout(config.call_timeout))
    }

    pub fn with_mesh_domain(mut self, domain: impl Into<String>) -> Self {
        self.mesh_domain = domain.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &Arc<dyn DiscoveryBackend> {
        &self.backend
    }

    pub fn mesh_domain(&self) -> &str {
        &self.mesh_domain
    }

    pub async fn register(&self, identity: ServiceIdentity) -> Result<Registration, RegistrationError> {
        let result = match identity.validate() {
            Ok(()) => self.backend.register_service(&identity).await.map_err(RegistrationError::from),
            Err(e) => Err(e),
        };
        record("meshcall_registrations_total", result.is_ok());
        result?;

        tracing::info!(service = %identity.name, id = %identity.id, address = ?identity.address, "service registered");
        Ok(Registration {
            identity,
            backend: self.backend.clone(),
            released: false,
        })
    }

    /// Passing instances of `peer`. Never an empty success.
    pub async fn resolve(&self, peer: &str) -> Result<Vec<ServiceInstance>, ResolutionError> {
        if !is_dns_label(peer) {
            record("meshcall_resolutions_total", false);
            return Err(ResolutionError::InvalidName(peer.to_string()));
        }
        let result = match self.backend.query_service(peer).await {
            Ok(instances) if instances.is_empty() => Err(ResolutionError::NotFound(peer.to_string())),
            Ok(instances) => Ok(instances),
            Err(e) => Err(ResolutionError::Unavailable(e)),
        };
        record("meshcall_resolutions_total", result.is_ok());
        let instances = result?;
        tracing::info!(%peer, instances = instances.len(), "peer resolved");
        Ok(instances)
    }

    pub async fn secure_client(&self, identity: &ServiceIdentity) -> Result<MeshClient, TransportError> {
        let roots = self.backend.ca_roots().await.map_err(TransportError::Certificate)?;
        let leaf = self
            .backend
            .leaf_certificate(&identity.name)
            .await
            .map_err(TransportError::Certificate)?;
        MeshClient::build(&leaf, &roots, self.backend.clone(), &self.mesh_domain, self.call_timeout)
    }

    pub async fn call(&self, client: &MeshClient, peer: &str) -> Result<Vec<u8>, CallError> {
        self.call_path(client, peer, "/").await
    }

    pub async fn call_path(&self, client: &MeshClient, peer: &str, path: &str) -> Result<Vec<u8>, CallError> {
        let result = client.get(peer, path).await;
        record("meshcall_calls_total", result.is_ok());
        match &result {
            Ok(body) => tracing::info!(%peer, bytes = body.len(), "call completed"),
            Err(e) => tracing::warn!(%peer, error = %e, "call failed"),
        }
        result
    }

    /// Idempotent: an identity the backend no longer knows is already deregistered.
    pub async fn deregister(&self, identity: &ServiceIdentity) -> Result<(), DeregistrationError> {
        deregister_id(self.backend.as_ref(), &identity.id).await
    }
}

async fn deregister_id(backend: &dyn DiscoveryBackend, id: &str) -> Result<(), DeregistrationError> {
    let result = match backend.deregister_service(id).await {
        Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
        Err(e) => Err(DeregistrationError::from(e)),
    };
    record("meshcall_deregistrations_total", result.is_ok());
    match &result {
        Ok(()) => tracing::info!(%id, "service deregistered"),
        Err(e) => tracing::error!(%id, error = %e, "deregistration failed"),
    }
    result
}

fn record(counter: &'static str, ok: bool) {
    let outcome = if ok { "success" } else { "failure" };
    metrics::counter!(counter, "outcome" => outcome).increment(1);
}

/// A live catalog entry owned by this process.
///
/// Release it with [`Registration::deregister`]. A handle dropped while still
/// registered schedules the deregistration on the current Tokio runtime.
pub struct Registration {
    identity: ServiceIdentity,
    backend: Arc<dyn DiscoveryBackend>,
    released: bool,
}

impl Registration {
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub async fn deregister(mut self) -> Result<(), DeregistrationError> {
        self.released = true;
        deregister_id(self.backend.as_ref(), &self.identity.id).await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let id = self.identity.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(%id, "registration dropped without deregistering, releasing in background");
                let backend = self.backend.clone();
                handle.spawn(async move {
                    let _ = deregister_id(backend.as_ref(), &id).await;
                });
            }
            Err(_) => {
                tracing::error!(%id, "registration dropped outside a runtime, catalog entry left behind");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_core::MemoryCatalog;

    #[tokio::test]
    async fn invalid_identities_never_reach_the_backend() {
        let catalog = Arc::new(MemoryCatalog::new());
        let facade = MeshFacade::new(catalog.clone());

        let err = facade.register(ServiceIdentity::new("bad name")).await.err().unwrap();
        assert!(matches!(err, RegistrationError::InvalidIdentity(_)));
        assert!(catalog.all_instances().is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let facade = MeshFacade::new(Arc::new(MemoryCatalog::new()));
        let _first = facade.register(ServiceIdentity::new("service2")).await.unwrap();

        let err = facade.register(ServiceIdentity::new("service2")).await.err().unwrap();
        assert!(matches!(err, RegistrationError::Rejected(_)));
    }
}
