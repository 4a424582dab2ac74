//! Executor service binary, run as the entrypoint of the sandbox image.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use sandbox_pool::{config::EXECUTOR_PORT, executor_service};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sandbox-executor")]
#[command(about = "Runs code snippets on behalf of the sandbox pool")]
struct Args {
    /// TCP port to listen on.
    #[arg(long, env = "PORT", default_value_t = EXECUTOR_PORT)]
    port: u16,

    /// Directory snippets are written to before they run.
    #[arg(long, default_value = "/tmp")]
    work_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let args = Args::parse();

    let addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind executor service on {}", addr))?;

    executor_service::serve(listener, args.work_dir, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Executor service shutting down");
    })
    .await
}
