pub mod config;
pub mod agent_backend;
pub mod mesh;
pub mod tls;
pub mod facade;
pub mod flow;

pub use config::{AgentConfig, ConfigError};
pub use agent_backend::AgentBackend;
pub use mesh::MeshClient;
pub use facade::{MeshFacade, Registration};
pub use flow::{run_client, FlowError, PeerRequest};
