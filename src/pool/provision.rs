//! Provisioning pipeline.
//!
//! `Requested → Started → AddressResolved → Settling → Ready`, one engine
//! call per step. A failing step tears down whatever was allocated so far
//! and propagates the error.

use std::{sync::Arc, time::Duration};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::PoolManager;
use crate::{
    container::{Container, LifecycleState},
    engine::ContainerSpec,
    error::{Result, SandboxError},
    retry::{retry_with_backoff, Backoff},
};

const MAX_REPLACEMENT_BACKOFF: Duration = Duration::from_secs(30);

impl PoolManager {
    /// Brings one container from request to Ready and registers it.
    pub(crate) async fn provision(&self) -> Result<Arc<Container>> {
        if self.inner.state.lock().await.closed {
            return Err(SandboxError::PoolClosed);
        }

        let config = &self.inner.config;
        let id = Uuid::new_v4().to_string();

        let scratch_dir = match &config.scratch_root {
            Some(root) => {
                let dir = root.join(&id);
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(SandboxError::provisioning)?;
                Some(dir)
            }
            None => None,
        };

        let mut spec = ContainerSpec::from_config(config);
        if let Some(dir) = &scratch_dir {
            spec = spec.with_scratch_dir(dir.clone());
        }

        let handle = match self.inner.engine.create_container(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(container_id = %id, error = %format!("{:#}", e), "Failed to create container");
                if let Some(dir) = &scratch_dir {
                    match tokio::fs::remove_dir_all(dir).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!(
                            container_id = %id,
                            dir = %dir.display(),
                            error = %e,
                            "Failed to remove scratch directory"
                        ),
                    }
                }
                return Err(SandboxError::provisioning(e));
            }
        };

        let container = Arc::new(Container::new(
            id,
            handle,
            self.inner.engine.clone(),
            self.inner.http.clone(),
            config.executor_port,
            scratch_dir,
        ));
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                drop(state);
                debug!(container_id = %container.id(), "Pool closed while creating, discarding container");
                self.retire(&container).await;
                return Err(SandboxError::PoolClosed);
            }
            state
                .booting
                .insert(container.id().to_string(), container.clone());
        }

        if let Err(e) = self.bring_up(&container).await {
            error!(
                container_id = %container.id(),
                handle = %container.handle(),
                error = %e,
                "Container provisioning failed"
            );
            let closed = {
                let mut state = self.inner.state.lock().await;
                state.booting.remove(container.id());
                state.closed
            };
            self.retire(&container).await;
            // A shutdown claimed the container mid-pipeline.
            if closed {
                return Err(SandboxError::PoolClosed);
            }
            return Err(e);
        }

        self.register_container(container.clone()).await?;
        info!(
            container_id = %container.id(),
            handle = %container.handle(),
            "Container successfully created"
        );
        Ok(container)
    }

    async fn bring_up(&self, container: &Container) -> Result<()> {
        let engine = &self.inner.engine;

        engine
            .start(container.handle())
            .await
            .map_err(SandboxError::provisioning)?;
        container.transition(LifecycleState::Started).await?;

        let address = engine
            .inspect(container.handle())
            .await
            .map_err(|e| SandboxError::AddressResolution {
                reason: format!("{:#}", e),
            })?
            .ok_or_else(|| SandboxError::AddressResolution {
                reason: format!("engine returned no network info for {}", container.handle()),
            })?;
        container.resolve_address(address).await?;

        container.transition(LifecycleState::Settling).await?;
        debug!(
            container_id = %container.id(),
            settle_delay_ms = self.inner.config.settle_delay_ms,
            "Waiting for the executor service to bind"
        );
        tokio::time::sleep(self.inner.config.settle_delay()).await;

        container.transition(LifecycleState::Ready).await
    }

    /// Provisions a replacement for a retired container.
    ///
    /// Failed attempts are retried with backoff. When they are exhausted the
    /// slot is recorded as lost and the pool runs one container short.
    pub(crate) async fn replace_container(&self) {
        let config = &self.inner.config;
        let result = retry_with_backoff(
            config.replacement_attempts,
            Backoff::Exponential {
                initial: config.replacement_backoff(),
                max: MAX_REPLACEMENT_BACKOFF,
            },
            "replacing container",
            || self.provision(),
            |e: &SandboxError| !matches!(e, SandboxError::PoolClosed),
        )
        .await;

        match result {
            Ok(container) => debug!(container_id = %container.id(), "Container replaced"),
            Err(SandboxError::PoolClosed) => debug!("Pool closed, container not replaced"),
            Err(e) => {
                let mut state = self.inner.state.lock().await;
                state.lost_slots += 1;
                warn!(
                    error = %e,
                    lost_slots = state.lost_slots,
                    target_size = state.target_size,
                    "Failed to replace container, pool shrinks by one"
                );
            }
        }
    }
}
