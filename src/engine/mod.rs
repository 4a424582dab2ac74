mod docker;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
pub use docker::DockerEngine;

use crate::config::PoolConfig;

/// Label attached to every container the pool creates.
pub const SANDBOX_LABEL: &str = "__docker_sandbox";

/// Path the per-container scratch directory is mounted at.
pub const SCRATCH_MOUNT: &str = "/scratch";

const SANDBOX_USER: &str = "sandboxuser";

/// Everything the engine needs to create one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub user: String,
    /// Memory limit in bytes.
    pub memory_bytes: i64,
    /// Cores the container is pinned to, in `cpuset-cpus` syntax.
    pub cpuset_cpus: String,
    pub pids_limit: i64,
    pub network_disabled: bool,
    pub labels: Vec<(String, String)>,
    /// Host directory bind-mounted at [`SCRATCH_MOUNT`].
    pub scratch_dir: Option<PathBuf>,
}

impl ContainerSpec {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            image: config.image_name.clone(),
            user: SANDBOX_USER.to_string(),
            memory_bytes: config.memory_limit_bytes(),
            cpuset_cpus: config.cpu_pinning.clone(),
            pids_limit: config.process_limit,
            network_disabled: !config.enable_network,
            labels: vec![(SANDBOX_LABEL.to_string(), "1".to_string())],
            scratch_dir: None,
        }
    }

    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = Some(dir);
        self
    }
}

/// Control API of the container engine.
///
/// Handles are opaque engine-assigned identifiers.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Create (but do not start) a container.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, handle: &str) -> Result<()>;

    /// Network address of a started container, or `None` when the engine
    /// reports no usable address.
    async fn inspect(&self, handle: &str) -> Result<Option<String>>;

    async fn stop(&self, handle: &str) -> Result<()>;

    async fn remove(&self, handle: &str, force: bool) -> Result<()>;
}
