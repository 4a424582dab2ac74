//! Runs untrusted code snippets in a warm pool of disposable containers.
//!
//! A [`PoolManager`] keeps a fixed number of sandbox containers ready.
//! Each submitted [`Job`] is executed by exactly one container, which is
//! torn down afterwards and replaced by a fresh one. The [`Sandbox`] facade
//! wires the pool to a Docker engine.

pub mod config;
pub mod container;
pub mod engine;
pub mod error;
pub mod executor_service;
pub mod job;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod retry;
pub mod sandbox;

pub use config::PoolConfig;
pub use container::{Container, LifecycleState};
pub use engine::{ContainerSpec, DockerEngine, EngineClient};
pub use error::{Result, SandboxError};
pub use job::{ExecutionResult, Job, JobHandle};
pub use pool::{PoolManager, PoolStatus};
pub use sandbox::{RunOptions, Sandbox};
