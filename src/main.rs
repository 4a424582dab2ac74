use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use sandbox_pool::{logging::setup_tracing, PoolConfig, RunOptions, Sandbox};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sandbox-pool")]
#[command(version, about = "Run code snippets in a pool of disposable containers", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run snippets concurrently and print one JSON result per line.
    Run {
        /// Language of every snippet.
        #[arg(short, long, default_value = "python")]
        language: String,
        /// Per-snippet timeout. Defaults to `default_timeout_ms` from the config.
        #[arg(short, long)]
        timeout_ms: Option<u64>,
        /// Inline snippet, may be repeated.
        #[arg(short = 'e', long = "eval")]
        snippets: Vec<String>,
        /// Files containing snippets.
        files: Vec<PathBuf>,
    },
    /// Fill the pool, print its status and shut it down.
    Check,
}

#[derive(Serialize)]
struct RunOutput {
    index: usize,
    #[serde(flatten)]
    result: Option<sandbox_pool::ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PoolConfig::from_path(
            path.to_str()
                .ok_or_else(|| anyhow::anyhow!("Config path contains invalid UTF-8"))?,
        )?,
        None => {
            let config = PoolConfig::default();
            config
                .validate()
                .context("Failed to validate default config")?;
            config
        }
    };

    setup_tracing(config.structured_logging)?;

    let sandbox = Sandbox::new(config).context("Failed to create sandbox")?;
    let outcome = tokio::select! {
        res = execute(&sandbox, cli.command) => res,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            Ok(())
        }
    };

    if let Err(e) = sandbox.shutdown().await {
        warn!(error = %e, "Pool cleanup reported errors");
    }
    outcome
}

async fn execute(sandbox: &Sandbox, command: Command) -> anyhow::Result<()> {
    sandbox
        .initialize()
        .await
        .context("Failed to initialize the container pool")?;

    match command {
        Command::Check => {
            let status = sandbox.status().await;
            println!("{}", serde_json::to_string(&status)?);
        }
        Command::Run {
            language,
            timeout_ms,
            snippets,
            files,
        } => {
            let mut codes = snippets;
            for file in &files {
                codes.push(
                    tokio::fs::read_to_string(file)
                        .await
                        .with_context(|| format!("Failed to read {}", file.display()))?,
                );
            }
            if codes.is_empty() {
                anyhow::bail!("nothing to run: pass --eval or at least one file");
            }

            info!(snippets = codes.len(), language = %language, "Submitting snippets");
            let runs = codes.into_iter().map(|code| {
                let mut options = RunOptions::new(code).language(language.clone());
                if let Some(ms) = timeout_ms {
                    options = options.timeout(Duration::from_millis(ms));
                }
                sandbox.run(options)
            });

            for (index, outcome) in join_all(runs).await.into_iter().enumerate() {
                let output = match outcome {
                    Ok(result) => RunOutput {
                        index,
                        result: Some(result),
                        error: None,
                    },
                    Err(e) => RunOutput {
                        index,
                        result: None,
                        error: Some(e.to_string()),
                    },
                };
                println!("{}", serde_json::to_string(&output)?);
            }
        }
    }
    Ok(())
}
