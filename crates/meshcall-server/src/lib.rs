pub mod agent_api;
pub mod checks;
pub mod serve;
pub mod service;
pub mod tls;

pub use agent_api::agent_router;
pub use checks::{run_checks, spawn_health_worker, CheckSchedule};
pub use serve::{serve_mesh, serve_plain, shutdown_signal};
pub use service::{health_router, hello_router, with_metrics};
pub use tls::{mesh_server_config, mesh_tls_config, TlsError};
