//! cyxmake build worker.
//!
//! Usage:
//!     cyxmake-worker --connect ws://coordinator:9876 --name builder-1

use anyhow::Result;
use clap::Parser;
use cyxmake_logging::{init_logging, LogConfig};
use cyxmake_worker::{AgentConfig, WorkerAgent};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cyxmake-worker", about = "Distributed build worker")]
struct Args {
    /// Coordinator URL (ws:// or wss://)
    #[arg(long, default_value = "ws://127.0.0.1:9876")]
    connect: String,

    /// Worker name (must be unique per coordinator)
    #[arg(long)]
    name: Option<String>,

    /// Pre-shared token or HMAC key (env: CYXMAKE_TOKEN)
    #[arg(long, env = "CYXMAKE_TOKEN", default_value = "")]
    token: String,

    /// Concurrent job limit
    #[arg(long, default_value_t = 2)]
    max_jobs: u32,

    /// Working directory for jobs without one of their own
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Log at the configured file level on the console too
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(LogConfig {
        app_name: "cyxmake-worker",
        verbose: args.verbose,
    })?;

    let name = args.name.unwrap_or_else(|| {
        format!(
            "worker-{}",
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
        )
    });
    let work_dir = match args.work_dir {
        Some(dir) => dir,
        None => {
            let dir = cyxmake_logging::cyxmake_home().join("work");
            std::fs::create_dir_all(&dir)?;
            dir
        }
    };

    tracing::info!("Starting cyxmake worker");
    tracing::info!("  Coordinator: {}", args.connect);
    tracing::info!("  Name: {}", name);
    tracing::info!("  Work dir: {}", work_dir.display());

    let agent = WorkerAgent::new(AgentConfig {
        coordinator_url: args.connect,
        name,
        secret: args.token,
        max_jobs: args.max_jobs,
        work_dir,
    });
    agent.run().await
}
