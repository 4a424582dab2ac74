//! Error taxonomy for the pool orchestrator.
//!
//! Execution timeouts are not errors: they are carried as
//! [`ExecutionResult`](crate::job::ExecutionResult) data. Pool exhaustion is
//! not an error either, it is resolved by queueing.

use std::fmt;

use crate::container::LifecycleState;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SandboxError {
    #[error("invalid pool size: {size}")]
    InvalidPoolSize { size: usize },

    #[error("pool is already initialized with {size} containers")]
    AlreadyInitialized { size: usize },

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("failed to provision container: {source:#}")]
    Provisioning { source: anyhow::Error },

    #[error("unable to resolve container address: {reason}")]
    AddressResolution { reason: String },

    #[error("unable to contact container: {source}")]
    Transport {
        #[from]
        source: reqwest::Error,
    },

    #[error("protocol error from executor: {0}")]
    Protocol(String),

    #[error("failed to tear down container {handle}: {reason}")]
    Teardown { handle: String, reason: String },

    #[error("invalid container state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("the pool has been shut down")]
    PoolClosed,

    #[error("pool initialization failed: {}", ErrorList(.0))]
    Initialization(Vec<SandboxError>),

    #[error("pool cleanup failed: {}", ErrorList(.0))]
    Cleanup(Vec<SandboxError>),
}

impl SandboxError {
    /// Identifies failures that the dispatcher may retry.
    ///
    /// Only transport-level failures qualify: a response that reports a
    /// program error or a timeout is a settled result.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub(crate) fn provisioning(source: impl Into<anyhow::Error>) -> Self {
        Self::Provisioning {
            source: source.into(),
        }
    }
}

struct ErrorList<'a>(&'a [SandboxError]);

impl fmt::Display for ErrorList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
