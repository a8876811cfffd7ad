//! cyxmake distributed build coordinator.
//!
//! Usage:
//!     cyxmake-coordinator --config cyxmake.toml
//!     cyxmake-coordinator --port 9876 --token shared-secret

use anyhow::Result;
use clap::Parser;
use cyxmake_coordinator::{Coordinator, CoordinatorConfig};
use cyxmake_logging::{init_logging, LogConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cyxmake-coordinator", about = "Distributed build coordinator")]
struct Args {
    /// Path to cyxmake.toml (defaults to <home>/cyxmake.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address override
    #[arg(long)]
    bind: Option<String>,

    /// Listen port override
    #[arg(long)]
    port: Option<u16>,

    /// Pre-shared auth token override (env: CYXMAKE_TOKEN)
    #[arg(long, env = "CYXMAKE_TOKEN")]
    token: Option<String>,

    /// Log at the configured file level on the console too
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(LogConfig {
        app_name: "cyxmake-coordinator",
        verbose: args.verbose,
    })?;

    let mut config = CoordinatorConfig::load_or_default(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.transport.bind_addr = bind;
    }
    if let Some(port) = args.port {
        config.transport.port = port;
    }
    if let Some(token) = args.token {
        config.auth.token = token;
    }

    tracing::info!("Starting cyxmake coordinator");
    tracing::info!(
        "  Listen: {}:{}",
        config.transport.bind_addr,
        config.transport.port
    );
    tracing::info!("  Auth: {:?}", config.auth.method);

    let coordinator = Coordinator::new(config)?;
    coordinator.start().await?;

    tokio::signal::ctrl_c().await?;
    coordinator.shutdown();
    Ok(())
}
