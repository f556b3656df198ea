//! GridRun manager server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use gridrun_core::PluginRegistry;
use gridrun_manager::{http, AppState, Config};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// GridRun manager.
#[derive(Parser, Debug)]
#[command(name = "gridrun-manager", about = "Distributes task divisions across grid agents")]
struct Args {
    /// HTTP bind address
    #[arg(long)]
    addr: Option<String>,

    /// Directory holding one subdirectory per repository
    #[arg(long)]
    repositories: Option<PathBuf>,

    /// Path of the gridrun-host executable
    #[arg(long)]
    host_binary: Option<PathBuf>,

    /// Idle seconds before a repository handle is closed
    #[arg(long)]
    creator_ttl_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let mut config = Config::default();
    if let Some(addr) = args.addr {
        config.bind_addr = addr;
    }
    if let Some(path) = args.repositories {
        config.repository_path = path;
    }
    if let Some(binary) = args.host_binary {
        config.host.binary = binary;
    }
    if let Some(secs) = args.creator_ttl_secs {
        config.creator_ttl = Duration::from_secs(secs);
    }
    let addr: SocketAddr = config.bind_addr.parse()?;

    let mut plugins = PluginRegistry::new();
    gridrun_tasks::register(&mut plugins);

    let state = AppState::new(config, plugins);
    match state.manager.load_repositories().await {
        Ok(count) => info!(
            repositories = count,
            path = %state.config().repository_path.display(),
            "Repositories loaded"
        ),
        Err(e) => warn!(error = %e, "Failed to load repositories"),
    }

    let router = http::create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "GridRun manager listening");

    tokio::select! {
        result = axum::serve(listener, router) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
