//! GridRun task host.
//!
//! Spawned by the manager for repositories that must not share its process.
//! The protocol runs over stdin/stdout, so logs go to stderr.

use std::path::PathBuf;

use clap::Parser;
use gridrun_core::PluginRegistry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// GridRun task host.
#[derive(Parser, Debug)]
#[command(name = "gridrun-host", about = "Hosts GridRun master tasks for one repository")]
struct Args {
    /// Repository served by this host
    #[arg(long)]
    repository: String,

    /// Repository directory
    #[arg(long)]
    directory: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    if let Some(directory) = &args.directory {
        std::env::set_current_dir(directory)?;
    }

    let mut plugins = PluginRegistry::new();
    gridrun_tasks::register(&mut plugins);

    info!(
        repository = %args.repository,
        pid = std::process::id(),
        plugins = ?plugins,
        "Task host started"
    );

    if let Err(e) = gridrun_ipc::serve(tokio::io::stdin(), tokio::io::stdout(), plugins).await {
        error!(error = %e, "Task host stopped with error");
        return Err(e.into());
    }

    info!(repository = %args.repository, "Task host stopped");
    Ok(())
}
