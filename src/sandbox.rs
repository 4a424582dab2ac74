//! Entry point for callers: owns the configuration, the engine client and
//! the pool.

use std::{sync::Arc, time::Duration};

use anyhow::Context;

use crate::{
    config::PoolConfig,
    engine::{DockerEngine, EngineClient},
    error::Result,
    job::{ExecutionResult, Job, JobHandle, DEFAULT_LANGUAGE},
    pool::{PoolManager, PoolStatus},
};

/// Options for one run. Unset fields fall back to the sandbox defaults.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub code: String,
    pub language: Option<String>,
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: None,
            timeout: None,
        }
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<&str> for RunOptions {
    fn from(code: &str) -> Self {
        RunOptions::new(code)
    }
}

impl From<String> for RunOptions {
    fn from(code: String) -> Self {
        RunOptions::new(code)
    }
}

pub struct Sandbox {
    pool: PoolManager,
}

impl Sandbox {
    /// Creates a sandbox backed by Docker.
    pub fn new(config: PoolConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let engine = DockerEngine::from_address(config.docker_address.as_deref())
            .context("Failed to create Docker engine client")?;
        Ok(Self::with_engine(config, Arc::new(engine)))
    }

    pub fn with_engine(config: PoolConfig, engine: Arc<dyn EngineClient>) -> Self {
        Self {
            pool: PoolManager::new(engine, config),
        }
    }

    /// Fills the pool with `pool_size` ready containers.
    pub async fn initialize(&self) -> Result<()> {
        self.pool.initialize(self.pool.config().pool_size).await
    }

    /// Queues a run and returns a handle to its result.
    pub async fn submit(&self, options: impl Into<RunOptions>) -> Result<JobHandle> {
        let options = options.into();
        let config = self.pool.config();
        let (job, handle) = Job::new(
            options.code,
            options
                .language
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            options.timeout.unwrap_or_else(|| config.default_timeout()),
        )?;
        self.pool.execute_job(job).await;
        Ok(handle)
    }

    /// Runs a snippet and waits for its result.
    pub async fn run(&self, options: impl Into<RunOptions>) -> Result<ExecutionResult> {
        self.submit(options).await?.result().await
    }

    pub async fn status(&self) -> PoolStatus {
        self.pool.status().await
    }

    /// Tears down every idle and provisioning container. Must be called by
    /// the host application before exiting.
    pub async fn shutdown(&self) -> Result<()> {
        self.pool.cleanup().await
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }
}
