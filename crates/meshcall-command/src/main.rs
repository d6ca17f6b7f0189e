use std::error::Error;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use meshcall_agent::{run_client, AgentConfig, MeshFacade, PeerRequest};
use meshcall_core::{CaRoots, HealthCheck, LeafCertificate, MemoryCatalog, ServiceIdentity};
use meshcall_server::{
    agent_router, health_router, hello_router, mesh_tls_config, serve_mesh, serve_plain,
    shutdown_signal, spawn_health_worker, with_metrics,
};

type BoxError = Box<dyn Error>;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);
const WORKER_TICK: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "meshcall")]
#[command(about = "Register, discover and call services over the mesh", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Agent HTTP address; overrides MESHCALL_AGENT_ADDR
    #[arg(long, global = true)]
    agent: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register, call a peer once over mTLS, deregister
    Call {
        #[arg(long)]
        name: String,
        #[arg(long)]
        peer: String,
        #[arg(long, default_value = "/")]
        path: String,
    },
    /// Serve the hello endpoint over mTLS while registered
    Serve {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: SocketAddr,
        /// Plain HTTP listener for `/health` and `/metrics`
        #[arg(long, default_value = "127.0.0.1:0")]
        health_listen: SocketAddr,
    },
    /// List passing instances of a service
    Lookup {
        #[arg(long)]
        service: String,
    },
    /// Run an in-memory development agent
    DevAgent {
        #[arg(long, default_value = "127.0.0.1:8500")]
        listen: SocketAddr,
        /// PEM bundle of CA roots
        #[arg(long)]
        ca_roots: PathBuf,
        /// Directory of `<service>.pem` and `<service>-key.pem` pairs
        #[arg(long)]
        certs: PathBuf,
        #[arg(long, env = "MESHCALL_AGENT_TOKEN")]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "meshcall failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let mut config = AgentConfig::from_env()?;
    if let Some(agent) = cli.agent {
        config.address = agent;
    }

    match cli.command {
        Commands::Call { name, peer, path } => {
            let facade = MeshFacade::from_config(&config)?;
            let request = PeerRequest::new(peer).with_path(path);
            let body = run_client(&facade, ServiceIdentity::new(name), &request, shutdown_signal()).await?;
            println!("{}", String::from_utf8_lossy(&body));
        }
        Commands::Serve { name, listen, health_listen } => serve(&config, name, listen, health_listen).await?,
        Commands::Lookup { service } => {
            let facade = MeshFacade::from_config(&config)?;
            let instances = facade.resolve(&service).await?;
            println!("{:<20} {:<20} {:<22} {:<10}", "ID", "Service", "Address", "Health");
            println!("{}", "-".repeat(72));
            for inst in instances {
                let address = inst.address.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
                println!("{:<20} {:<20} {:<22} {:<10}", inst.id, inst.service, address, inst.health);
            }
        }
        Commands::DevAgent { listen, ca_roots, certs, token } => {
            let roots = CaRoots::new(config.mesh_domain.clone(), vec![std::fs::read_to_string(&ca_roots)?]);
            let mut catalog = MemoryCatalog::new().with_ca_roots(roots);
            for leaf in read_leaves(&certs)? {
                tracing::info!(service = %leaf.service, "leaf certificate provisioned");
                catalog = catalog.with_leaf(leaf);
            }
            let catalog = Arc::new(catalog);

            let worker = spawn_health_worker(catalog.clone(), WORKER_TICK);
            let listener = TcpListener::bind(listen)?;
            let served = serve_plain(listener, agent_router(catalog, token), shutdown_signal()).await;
            worker.abort();
            served?;
        }
    }

    Ok(())
}

/// Service role: register with a health check, serve until a signal, deregister.
///
/// The agent cannot present a mesh certificate, so `/health` and `/metrics`
/// live on a separate plain listener.
async fn serve(config: &AgentConfig, name: String, listen: SocketAddr, health_listen: SocketAddr) -> Result<(), BoxError> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).ok();

    let facade = MeshFacade::from_config(config)?;
    let roots = facade.backend().ca_roots().await?;
    let leaf = facade.backend().leaf_certificate(&name).await?;
    let tls = mesh_tls_config(&leaf, &roots)?;

    let listener = TcpListener::bind(listen)?;
    let addr = listener.local_addr()?;
    let health_listener = TcpListener::bind(health_listen)?;
    let health_addr = health_listener.local_addr()?;

    let (stop, stopped) = watch::channel(());
    let health = tokio::spawn(serve_plain(
        health_listener,
        with_metrics(health_router(), handle),
        wait_for(stopped),
    ));

    let check = HealthCheck::http(format!("http://{health_addr}/health"), CHECK_INTERVAL);
    let registration = facade
        .register(ServiceIdentity::new(name.as_str()).with_address(addr).with_check(check))
        .await?;

    let served = serve_mesh(listener, hello_router(&name), tls, shutdown_signal()).await;
    let released = registration.deregister().await;
    let _ = stop.send(());
    let health_served = health.await?;
    served?;
    released?;
    health_served?;
    Ok(())
}

async fn wait_for(mut stopped: watch::Receiver<()>) {
    // A dropped sender counts as a stop too.
    let _ = stopped.changed().await;
}

/// Every `<service>.pem` in `dir` with a sibling `<service>-key.pem`.
fn read_leaves(dir: &Path) -> Result<Vec<LeafCertificate>, BoxError> {
    let mut leaves = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(service) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".pem"))
            .filter(|s| !s.ends_with("-key"))
        else {
            continue;
        };
        let key_path = dir.join(format!("{service}-key.pem"));
        if !key_path.exists() {
            tracing::warn!(cert = %path.display(), "no matching key, skipped");
            continue;
        }
        leaves.push(LeafCertificate::new(
            service,
            std::fs::read_to_string(&path)?,
            std::fs::read_to_string(&key_path)?,
        ));
    }
    Ok(leaves)
}
