use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptions,
        InspectContainerOptions,
        RemoveContainerOptions,
        StartContainerOptions,
        StopContainerOptions,
    },
    Docker,
};
use tracing::{debug, info};

use super::{ContainerSpec, EngineClient, SCRATCH_MOUNT};

/// Seconds Docker waits for a graceful stop before killing the container.
const STOP_GRACE_SECS: i32 = 2;

/// [`EngineClient`] backed by the Docker Engine API.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the default Docker socket.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Connect to a specific Docker address.
    ///
    /// Supported address formats:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    pub fn with_address(address: &str) -> Result<Self> {
        let docker = if address.starts_with("http://") || address.starts_with("tcp://") {
            let addr = address
                .trim_start_matches("http://")
                .trim_start_matches("tcp://");
            Docker::connect_with_http(
                &format!("http://{}", addr),
                120,
                bollard::API_DEFAULT_VERSION,
            )
            .context("Failed to connect to Docker daemon via HTTP")?
        } else {
            let socket_path = address.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .context("Failed to connect to Docker daemon via Unix socket")?
        };
        Ok(Self { docker })
    }

    pub fn from_address(address: Option<&str>) -> Result<Self> {
        match address {
            Some(address) => Self::with_address(address),
            None => Self::new(),
        }
    }
}

fn is_status(err: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

/// Picks the address of the `bridge` network if it has one, otherwise the
/// first non-empty address in network-name order.
fn first_address(
    networks: impl IntoIterator<Item = (String, Option<String>)>,
) -> Option<(String, String)> {
    let mut candidates: Vec<(String, String)> = networks
        .into_iter()
        .filter_map(|(name, ip)| ip.filter(|ip| !ip.is_empty()).map(|ip| (name, ip)))
        .collect();
    candidates.sort_by(|(a, _), (b, _)| (a != "bridge", a).cmp(&(b != "bridge", b)));
    candidates.into_iter().next()
}

fn build_create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let labels: HashMap<String, String> = spec.labels.iter().cloned().collect();
    let binds = spec
        .scratch_dir
        .as_ref()
        .map(|dir| vec![format!("{}:{}", dir.display(), SCRATCH_MOUNT)]);

    let host_config = HostConfig {
        memory: Some(spec.memory_bytes),
        memory_swap: Some(-1),
        cpuset_cpus: Some(spec.cpuset_cpus.clone()),
        pids_limit: Some(spec.pids_limit),
        privileged: Some(false),
        binds,
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        user: Some(spec.user.clone()),
        network_disabled: Some(spec.network_disabled),
        attach_stdin: Some(false),
        attach_stdout: Some(false),
        attach_stderr: Some(false),
        open_stdin: Some(false),
        tty: Some(false),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl EngineClient for DockerEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let response = self
            .docker
            .create_container(
                None::<CreateContainerOptions>,
                build_create_body(spec),
            )
            .await
            .with_context(|| format!("Failed to create container from image {}", spec.image))?;

        info!(
            handle = %response.id,
            image = %spec.image,
            memory_bytes = spec.memory_bytes,
            cpuset_cpus = %spec.cpuset_cpus,
            "Container created"
        );
        Ok(response.id)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        self.docker
            .start_container(handle, None::<StartContainerOptions>)
            .await
            .context("Failed to start container")?;
        Ok(())
    }

    async fn inspect(&self, handle: &str) -> Result<Option<String>> {
        let inspect = self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;

        let Some(networks) = inspect.network_settings.and_then(|ns| ns.networks) else {
            return Ok(None);
        };

        let address = first_address(
            networks
                .into_iter()
                .map(|(name, endpoint)| (name, endpoint.ip_address)),
        );
        if let Some((network, ip)) = &address {
            debug!(handle = %handle, network = %network, ip = %ip, "Resolved container address");
        }
        Ok(address.map(|(_, ip)| ip))
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(STOP_GRACE_SECS),
            ..Default::default()
        };
        match self.docker.stop_container(handle, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(e) if is_status(&e, 304) || is_status(&e, 404) => Ok(()),
            Err(e) => Err(e).context("Failed to stop container"),
        }
    }

    async fn remove(&self, handle: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        match self.docker.remove_container(handle, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e).context("Failed to remove container"),
        }
    }
}
