use async_trait::async_trait;

use crate::certs::{CaRoots, LeafCertificate};
use crate::errors::BackendError;
use crate::identity::ServiceIdentity;
use crate::instance::ServiceInstance;

/// Request/response surface of a discovery backend.
///
/// `deregister_service` on an id the backend does not know is not an error.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    async fn register_service(&self, identity: &ServiceIdentity) -> Result<(), BackendError>;
    async fn deregister_service(&self, service_id: &str) -> Result<(), BackendError>;
    /// Passing instances of `name`; an empty list when there are none.
    async fn query_service(&self, name: &str) -> Result<Vec<ServiceInstance>, BackendError>;
    async fn ca_roots(&self) -> Result<CaRoots, BackendError>;
    async fn leaf_certificate(&self, service: &str) -> Result<LeafCertificate, BackendError>;
}
