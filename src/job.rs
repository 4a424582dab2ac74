//! Jobs and their results.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{Result, SandboxError};

pub const DEFAULT_LANGUAGE: &str = "python";

/// Outcome of running one snippet, as reported by the executor service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub combined: String,
    pub is_error: bool,
    pub timed_out: bool,
    #[serde(default)]
    pub killed_by_container: bool,
}

impl ExecutionResult {
    /// Result synthesized when the executor did not answer within the
    /// client-side timeout.
    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            is_error: true,
            ..Default::default()
        }
    }
}

/// One code-execution request.
///
/// A job is immutable once built. Its result sink is consumed by
/// [`Job::complete`], so a result can only be delivered once.
#[derive(Debug)]
pub struct Job {
    code: String,
    language: String,
    timeout: Duration,
    sink: oneshot::Sender<Result<ExecutionResult>>,
}

/// Receiving side of a job's result sink.
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<Result<ExecutionResult>>,
}

impl Job {
    pub fn new(
        code: impl Into<String>,
        language: impl Into<String>,
        timeout: Duration,
    ) -> Result<(Job, JobHandle)> {
        let code = code.into();
        if code.is_empty() {
            return Err(SandboxError::InvalidJob("code must not be empty".into()));
        }
        if timeout.is_zero() {
            return Err(SandboxError::InvalidJob(
                "timeout must be greater than zero".into(),
            ));
        }
        let language = language.into();
        let language = if language.is_empty() {
            DEFAULT_LANGUAGE.to_string()
        } else {
            language
        };

        let (sink, rx) = oneshot::channel();
        Ok((
            Job {
                code,
                language,
                timeout,
                sink,
            },
            JobHandle { rx },
        ))
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Delivers the outcome to the submitter. A dropped handle is not an
    /// error: nobody is waiting for the result any more.
    pub fn complete(self, outcome: Result<ExecutionResult>) {
        if self.sink.send(outcome).is_err() {
            tracing::debug!("job handle dropped before the result was delivered");
        }
    }
}

impl JobHandle {
    /// Waits for the job to settle.
    pub async fn result(self) -> Result<ExecutionResult> {
        self.rx.await.unwrap_or(Err(SandboxError::PoolClosed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_code_is_rejected() {
        let err = Job::new("", "python", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidJob(_)));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        assert!(Job::new("print(1)", "python", Duration::ZERO).is_err());
    }

    #[test]
    fn test_empty_language_defaults_to_python() {
        let (job, _handle) = Job::new("print(1)", "", Duration::from_secs(1)).unwrap();
        assert_eq!(job.language(), DEFAULT_LANGUAGE);
    }

    #[tokio::test]
    async fn test_complete_delivers_to_handle() {
        let (job, handle) = Job::new("print(1)", "python", Duration::from_secs(1)).unwrap();
        job.complete(Ok(ExecutionResult {
            stdout: "1\n".into(),
            combined: "1\n".into(),
            ..Default::default()
        }));
        let result = handle.result().await.unwrap();
        assert_eq!(result.stdout, "1\n");
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn test_dropped_job_reports_pool_closed() {
        let (job, handle) = Job::new("print(1)", "python", Duration::from_secs(1)).unwrap();
        drop(job);
        assert!(matches!(
            handle.result().await,
            Err(SandboxError::PoolClosed)
        ));
    }

    #[test]
    fn test_missing_killed_by_container_defaults_to_false() {
        let result: ExecutionResult = serde_json::from_str(
            r#"{"stdout":"a","stderr":"","combined":"a","isError":false,"timedOut":false}"#,
        )
        .unwrap();
        assert!(!result.killed_by_container);
    }

    #[test]
    fn test_synthesized_timeout_result() {
        let result = ExecutionResult::timed_out();
        assert!(result.timed_out);
        assert!(result.is_error);
        assert!(result.combined.is_empty());
        assert!(!result.killed_by_container);
    }
}
