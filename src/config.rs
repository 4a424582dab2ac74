use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

/// Port the executor service listens on inside every sandbox container.
pub const EXECUTOR_PORT: u16 = 3000;

pub const DEFAULT_IMAGE: &str = "christophetd/docker-sandbox";

/// Extra time granted to the client on top of the job timeout, so the
/// request timeout only fires when the executor itself is unresponsive.
pub const CLIENT_TIMEOUT_MARGIN: Duration = Duration::from_millis(500);

const ENV_PREFIX: &str = "SANDBOX_";

/// Configuration for the sandbox pool.
///
/// Every field is optional in the YAML file; absent options fall back to the
/// defaults below.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of warm containers kept in the pool.
    #[serde_inline_default(1)]
    pub pool_size: usize,
    /// Memory limit per container, in megabytes.
    #[serde_inline_default(50)]
    pub memory_limit_mb: u64,
    /// Image every sandbox container is created from.
    #[serde_inline_default(DEFAULT_IMAGE.to_string())]
    pub image_name: String,
    /// Whether sandbox containers get network access.
    #[serde(default)]
    pub enable_network: bool,
    /// Timeout applied to jobs submitted without one.
    #[serde_inline_default(10_000)]
    pub default_timeout_ms: u64,
    /// CPU set the containers are pinned to (Docker `cpuset-cpus` syntax).
    #[serde_inline_default("0".to_string())]
    pub cpu_pinning: String,
    /// Maximum number of processes inside a container.
    #[serde_inline_default(64)]
    pub process_limit: i64,
    /// Grace period after start before a container is considered usable.
    #[serde_inline_default(1_000)]
    pub settle_delay_ms: u64,
    /// Port of the executor service inside the container.
    #[serde_inline_default(EXECUTOR_PORT)]
    pub executor_port: u16,
    /// Attempts made to reach the executor before a job fails.
    #[serde_inline_default(10)]
    pub dispatch_attempts: u32,
    #[serde_inline_default(500)]
    pub dispatch_retry_interval_ms: u64,
    /// Attempts made to provision a replacement after a job completes.
    #[serde_inline_default(3)]
    pub replacement_attempts: u32,
    #[serde_inline_default(1_000)]
    pub replacement_backoff_ms: u64,
    /// Host directory under which each container gets a private scratch
    /// directory, bind-mounted at `/scratch`. Disabled when unset.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
    /// Docker daemon address. Uses the local defaults when unset.
    #[serde(default)]
    pub docker_address: Option<String>,
    /// Emit JSON logs instead of the compact human format.
    #[serde(default)]
    pub structured_logging: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            memory_limit_mb: 50,
            image_name: DEFAULT_IMAGE.to_string(),
            enable_network: false,
            default_timeout_ms: 10_000,
            cpu_pinning: "0".to_string(),
            process_limit: 64,
            settle_delay_ms: 1_000,
            executor_port: EXECUTOR_PORT,
            dispatch_attempts: 10,
            dispatch_retry_interval_ms: 500,
            replacement_attempts: 3,
            replacement_backoff_ms: 1_000,
            scratch_root: None,
            docker_address: None,
            structured_logging: false,
        }
    }
}

impl PoolConfig {
    /// Loads the configuration from a YAML file, then applies `SANDBOX_`
    /// prefixed environment overrides.
    pub fn from_path(path: &str) -> Result<PoolConfig> {
        let config: PoolConfig = Figment::new()
            .merge(Serialized::defaults(PoolConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<PoolConfig> {
        let config: PoolConfig = Figment::new()
            .merge(Serialized::defaults(PoolConfig::default()))
            .merge(Yaml::string(config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            anyhow::bail!("pool_size must be at least 1");
        }
        if self.default_timeout_ms == 0 {
            anyhow::bail!("default_timeout_ms must be greater than 0");
        }
        if self.memory_limit_mb == 0 {
            anyhow::bail!("memory_limit_mb must be greater than 0");
        }
        if self.dispatch_attempts == 0 {
            anyhow::bail!("dispatch_attempts must be at least 1");
        }
        if self.image_name.is_empty() {
            anyhow::bail!("image_name must not be empty");
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn dispatch_retry_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_retry_interval_ms)
    }

    pub fn replacement_backoff(&self) -> Duration {
        Duration::from_millis(self.replacement_backoff_ms)
    }

    /// Memory limit in bytes, as handed to the engine.
    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb * 1_000_000) as i64
    }
}
