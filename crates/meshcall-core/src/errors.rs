use thiserror::Error;

/// Failure reported by a `DiscoveryBackend` implementation.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("discovery backend unreachable: {0}")]
    Unreachable(String),

    #[error("discovery backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed backend response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("registration failed: {0}")]
    Unavailable(#[source] BackendError),
}

impl From<BackendError> for RegistrationError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Rejected { status, message } => {
                RegistrationError::Rejected(format!("{status}: {message}"))
            }
            other => RegistrationError::Unavailable(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("{0:?} is not a valid service name")]
    InvalidName(String),

    #[error("no healthy instances of {0}")]
    NotFound(String),

    #[error("discovery backend unavailable: {0}")]
    Unavailable(#[source] BackendError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not obtain certificate material: {0}")]
    Certificate(#[source] BackendError),

    #[error("invalid certificate material: {0}")]
    InvalidMaterial(String),

    #[error("could not build mesh client: {0}")]
    Client(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid peer name {0:?}")]
    InvalidPeer(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("peer answered with status {status}")]
    Status { status: u16, body: Vec<u8> },
}

#[derive(Debug, Error)]
pub enum DeregistrationError {
    #[error("deregistration rejected: {0}")]
    Rejected(String),

    #[error("deregistration failed: {0}")]
    Unavailable(#[source] BackendError),
}

impl From<BackendError> for DeregistrationError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Rejected { status, message } => {
                DeregistrationError::Rejected(format!("{status}: {message}"))
            }
            other => DeregistrationError::Unavailable(other),
        }
    }
}

/// Illegal move through the registration lifecycle.
#[derive(Debug, Error)]
#[error("cannot move from {from:?} to {to:?}")]
pub struct LifecycleError {
    pub from: crate::lifecycle::Stage,
    pub to: crate::lifecycle::Stage,
}
