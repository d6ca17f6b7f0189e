use std::future::Future;

use thiserror::Error;

use meshcall_core::{
    CallError, DeregistrationError, Lifecycle, LifecycleError, RegistrationError, ResolutionError,
    ServiceIdentity, Stage, TransportError,
};

use crate::facade::MeshFacade;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Register(#[from] RegistrationError),

    #[error(transparent)]
    Resolve(#[from] ResolutionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Deregister(#[from] DeregistrationError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("interrupted by shutdown request")]
    Interrupted,
}

/// What the client role asks of its peer.
#[derive(Debug, Clone)]
pub struct PeerRequest {
    pub peer: String,
    pub path: String,
}

impl PeerRequest {
    pub fn new(peer: impl Into<String>) -> Self {
        Self { peer: peer.into(), path: "/".to_string() }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

/// Registers `identity`, calls the peer once and deregisters again.
///
/// Deregistration runs on every path out of here: success, any failure after
/// registration, and `shutdown` resolving first. When the exchange failed, its
/// error wins over a failed deregistration, which is only logged.
pub async fn run_client(
    facade: &MeshFacade,
    identity: ServiceIdentity,
    request: &PeerRequest,
    shutdown: impl Future<Output = ()>,
) -> Result<Vec<u8>, FlowError> {
    let mut lifecycle = Lifecycle::new();
    let registration = facade.register(identity).await?;
    lifecycle.advance(Stage::Registered)?;

    let outcome = tokio::select! {
        result = exchange(facade, registration.identity(), request, &mut lifecycle) => result,
        _ = shutdown => {
            tracing::warn!(service = %registration.identity().name, "shutdown requested before the call finished");
            Err(FlowError::Interrupted)
        }
    };

    let reached = lifecycle.stage();
    let released = registration.deregister().await;
    if released.is_ok() {
        lifecycle.advance(Stage::Deregistered)?;
    }

    match (outcome, released) {
        (Ok(body), Ok(())) => Ok(body),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => {
            tracing::warn!(stage = ?reached, error = %e, "client flow failed, registration released");
            Err(e)
        }
        (Err(e), Err(release)) => {
            tracing::error!(stage = ?reached, error = %e, release_error = %release, "client flow failed and registration was not released");
            Err(e)
        }
    }
}

async fn exchange(
    facade: &MeshFacade,
    identity: &ServiceIdentity,
    request: &PeerRequest,
    lifecycle: &mut Lifecycle,
) -> Result<Vec<u8>, FlowError> {
    facade.resolve(&request.peer).await?;
    lifecycle.advance(Stage::Resolved)?;

    let client = facade.secure_client(identity).await?;
    let body = facade.call_path(&client, &request.peer, &request.path).await?;
    lifecycle.advance(Stage::Called)?;
    Ok(body)
}
