//! Warm pool of single-use sandbox containers.
//!
//! All pool state (ready containers, provisioning containers and waiting
//! jobs) lives behind one mutex that is only held for queue manipulation,
//! never across engine or network I/O. Every registration or submission
//! resolves the queue imbalance under that lock, so a job never waits while
//! a ready container sits idle.
//!
//! Dispatches, retirements and replacements run on a [`TaskTracker`] owned
//! by the pool; shutdown waits for all of them.

mod provision;

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use crate::{
    config::PoolConfig,
    container::{Container, LifecycleState},
    engine::EngineClient,
    error::{Result, SandboxError},
    job::Job,
    retry::{retry_with_backoff, Backoff},
};

#[derive(Default)]
struct PoolState {
    available: VecDeque<Arc<Container>>,
    booting: HashMap<String, Arc<Container>>,
    waiting: VecDeque<Job>,
    target_size: usize,
    lost_slots: usize,
    closed: bool,
    /// Teardown failures of tracked work that finished after shutdown began.
    shutdown_errors: Vec<SandboxError>,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Size requested at initialization.
    pub target_size: usize,
    pub available: usize,
    pub booting: usize,
    pub waiting: usize,
    /// Slots given up after replacement provisioning kept failing.
    pub lost_slots: usize,
    pub closed: bool,
}

struct PoolInner {
    engine: Arc<dyn EngineClient>,
    config: PoolConfig,
    http: reqwest::Client,
    state: Mutex<PoolState>,
    tasks: TaskTracker,
}

/// Owns the pool and dispatches jobs to its containers.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

enum Registration {
    Dispatch(Job),
    Pooled,
    Discard { owned: bool },
}

impl PoolManager {
    pub fn new(engine: Arc<dyn EngineClient>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                engine,
                config,
                http: reqwest::Client::new(),
                state: Mutex::new(PoolState::default()),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Provisions `size` containers concurrently and waits for all of them.
    ///
    /// If any pipeline fails, every pipeline error is returned and the
    /// containers that did become ready are torn down again, so a failed
    /// initialization leaves no idle containers behind. An open pool that
    /// is already initialized is rejected; a pool that was shut down may be
    /// initialized again.
    pub async fn initialize(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(SandboxError::InvalidPoolSize { size });
        }
        {
            let mut state = self.inner.state.lock().await;
            if !state.closed && state.target_size > 0 {
                return Err(SandboxError::AlreadyInitialized {
                    size: state.target_size,
                });
            }
            state.closed = false;
            state.target_size = size;
            state.lost_slots = 0;
            state.shutdown_errors.clear();
        }
        self.inner.tasks.reopen();

        info!(size, "Creating the container pool");
        let results = join_all((0..size).map(|_| self.provision())).await;
        let errors: Vec<SandboxError> = results.into_iter().filter_map(|r| r.err()).collect();
        if errors.is_empty() {
            info!(size, "Container pool ready");
            return Ok(());
        }

        warn!(
            size,
            failed = errors.len(),
            "Pool initialization failed, tearing down ready containers"
        );
        let idle: Vec<Arc<Container>> = {
            let mut state = self.inner.state.lock().await;
            state.target_size = 0;
            state.available.drain(..).collect()
        };
        for (container, result) in idle
            .iter()
            .zip(join_all(idle.iter().map(|c| c.cleanup())).await)
        {
            if let Err(e) = result {
                warn!(container_id = %container.id(), error = %e, "Rollback teardown failed");
            }
        }
        Err(SandboxError::Initialization(errors))
    }

    /// Submits a job.
    ///
    /// The job is dispatched right away when a ready container exists and
    /// queued otherwise. Its outcome is delivered through its handle.
    pub async fn execute_job(&self, job: Job) {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            drop(state);
            job.complete(Err(SandboxError::PoolClosed));
            return;
        }
        match state.available.pop_front() {
            Some(container) => {
                drop(state);
                self.spawn_dispatch(container, job);
            }
            None => {
                state.waiting.push_back(job);
                debug!(waiting = state.waiting.len(), "No container available, job queued");
            }
        }
    }

    /// Hands a container that just became ready to the pool.
    ///
    /// A waiting job is served by this container directly, bypassing the
    /// ready queue. Containers arriving after the pool was shut down, or
    /// already claimed by a pool cleanup, are torn down.
    pub(crate) async fn register_container(&self, container: Arc<Container>) -> Result<()> {
        let registration = {
            let mut state = self.inner.state.lock().await;
            let owned = state.booting.remove(container.id()).is_some();
            if state.closed || !owned {
                Registration::Discard { owned }
            } else if let Some(job) = state.waiting.pop_front() {
                Registration::Dispatch(job)
            } else {
                state.available.push_back(container.clone());
                Registration::Pooled
            }
        };

        match registration {
            Registration::Dispatch(job) => {
                debug!(container_id = %container.id(), "Serving a waiting job");
                self.spawn_dispatch(container, job);
                Ok(())
            }
            Registration::Pooled => {
                debug!(container_id = %container.id(), "Container added to the pool");
                Ok(())
            }
            Registration::Discard { owned } => {
                debug!(container_id = %container.id(), owned, "Pool closed, discarding container");
                self.retire(&container).await;
                Err(SandboxError::PoolClosed)
            }
        }
    }

    /// Tears a container down, logging failures. Failures seen after
    /// shutdown began are reported by [`PoolManager::cleanup`].
    pub(crate) async fn retire(&self, container: &Container) {
        if let Err(e) = container.cleanup().await {
            warn!(container_id = %container.id(), error = %e, "Failed to tear down container");
            let mut state = self.inner.state.lock().await;
            if state.closed {
                state.shutdown_errors.push(e);
            }
        }
    }

    fn spawn_dispatch(&self, container: Arc<Container>, job: Job) {
        let pool = self.clone();
        let span = tracing::info_span!("dispatch", container_id = %container.id());
        self.inner
            .tasks
            .spawn(async move { pool.dispatch(container, job).await }.instrument(span));
    }

    /// Runs one job on one container, then retires the container.
    ///
    /// The result is delivered before teardown starts; teardown and the
    /// replacement pipeline run in the background.
    async fn dispatch(&self, container: Arc<Container>, job: Job) {
        let config = &self.inner.config;
        let outcome = match container.transition(LifecycleState::Executing).await {
            Ok(()) => {
                retry_with_backoff(
                    config.dispatch_attempts,
                    Backoff::Fixed(config.dispatch_retry_interval()),
                    "executing job",
                    || container.execute_job(&job),
                    SandboxError::is_retryable,
                )
                .await
            }
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(result) => debug!(
                is_error = result.is_error,
                timed_out = result.timed_out,
                "Code execution done"
            ),
            Err(e) => warn!(error = %e, "Job failed"),
        }
        job.complete(outcome);

        let pool = self.clone();
        self.inner
            .tasks
            .spawn(async move { pool.retire(&container).await }.in_current_span());

        let pool = self.clone();
        self.inner
            .tasks
            .spawn(async move { pool.replace_container().await }.in_current_span());
    }

    /// Shuts the pool down.
    ///
    /// Tears down every ready and provisioning container concurrently and
    /// fails every waiting job with [`SandboxError::PoolClosed`]. Jobs
    /// already running are not interrupted: this waits for them to finish,
    /// for their containers to be torn down and for in-flight replacement
    /// pipelines to discard what they created. When it returns, the engine
    /// holds no container of this pool. Calling this again is a no-op.
    pub async fn cleanup(&self) -> Result<()> {
        let (containers, waiting) = {
            let mut state = self.inner.state.lock().await;
            state.closed = true;
            let mut containers: Vec<Arc<Container>> = state.available.drain(..).collect();
            containers.extend(state.booting.drain().map(|(_, c)| c));
            (containers, std::mem::take(&mut state.waiting))
        };

        info!(
            containers = containers.len(),
            waiting_jobs = waiting.len(),
            "Cleaning up all containers"
        );
        for job in waiting {
            job.complete(Err(SandboxError::PoolClosed));
        }

        let mut errors: Vec<SandboxError> = join_all(containers.iter().map(|c| c.cleanup()))
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect();

        self.inner.tasks.close();
        if !self.inner.tasks.is_empty() {
            debug!(tasks = self.inner.tasks.len(), "Waiting for in-flight work");
        }
        self.inner.tasks.wait().await;
        errors.append(&mut self.inner.state.lock().await.shutdown_errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Cleanup(errors))
        }
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock().await;
        PoolStatus {
            target_size: state.target_size,
            available: state.available.len(),
            booting: state.booting.len(),
            waiting: state.waiting.len(),
            lost_slots: state.lost_slots,
            closed: state.closed,
        }
    }
}
