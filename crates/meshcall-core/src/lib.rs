pub mod identity;
pub mod instance;
pub mod health;
pub mod certs;
pub mod backend;
pub mod memory;
pub mod errors;
pub mod lifecycle;
pub mod wire;

pub use identity::{HealthCheck, ServiceIdentity};
pub use instance::ServiceInstance;
pub use health::HealthStatus;
pub use certs::{CaRoots, LeafCertificate};
pub use backend::DiscoveryBackend;
pub use memory::MemoryCatalog;
pub use errors::{
    BackendError, CallError, DeregistrationError, LifecycleError, RegistrationError,
    ResolutionError, TransportError,
};
pub use lifecycle::{Lifecycle, Stage};
