//! The executor service that runs inside every sandbox container.
//!
//! Accepts `POST /` with `{code, language, timeoutMs}`, writes the snippet
//! to a scratch file, runs the matching interpreter and answers with the
//! captured output. Snippets that outlive their timeout are killed.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json,
    Router,
};
use serde::Deserialize;
use tokio::{io::AsyncReadExt, net::TcpListener, process::Command};
use tracing::{error, info, warn};

use crate::{
    job::{ExecutionResult, DEFAULT_LANGUAGE},
    protocol::ErrorResponse,
};

/// How a language is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interpreter {
    pub program: &'static str,
    pub args: &'static [&'static str],
    pub extension: &'static str,
}

pub fn interpreter_for(language: &str) -> Option<Interpreter> {
    let interpreter = match language {
        "python" | "python3" => Interpreter {
            program: "python3",
            args: &["-u"],
            extension: ".py",
        },
        "python2" => Interpreter {
            program: "python",
            args: &["-u"],
            extension: ".py",
        },
        "node" | "javascript" => Interpreter {
            program: "node",
            args: &[],
            extension: ".js",
        },
        "ruby" => Interpreter {
            program: "ruby",
            args: &[],
            extension: ".rb",
        },
        "sh" | "bash" => Interpreter {
            program: "sh",
            args: &[],
            extension: ".sh",
        },
        _ => return None,
    };
    Some(interpreter)
}

/// Incoming request. Fields are optional so that missing ones can be
/// answered with the documented error body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingRequest {
    code: Option<String>,
    language: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Clone)]
struct ExecutorState {
    work_dir: Arc<PathBuf>,
}

pub fn router(work_dir: PathBuf) -> Router {
    Router::new()
        .route("/", post(execute))
        .with_state(ExecutorState {
            work_dir: Arc::new(work_dir),
        })
}

/// Serves the executor API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    work_dir: PathBuf,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), work_dir = %work_dir.display(), "Container service running");
    axum::serve(listener, router(work_dir))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Executor server error")
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn execute(
    State(state): State<ExecutorState>,
    Json(req): Json<IncomingRequest>,
) -> Response {
    let code = req.code.filter(|c| !c.is_empty());
    let timeout_ms = req.timeout_ms.filter(|t| *t > 0);
    let (Some(code), Some(timeout_ms)) = (code, timeout_ms) else {
        return error_response(StatusCode::BAD_REQUEST, "no code or timeout specified");
    };

    let language = req
        .language
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
    let Some(interpreter) = interpreter_for(&language) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unsupported language: {}", language),
        );
    };

    match run_snippet(
        &state.work_dir,
        interpreter,
        &code,
        Duration::from_millis(timeout_ms),
    )
    .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            error!(error = %format!("{:#}", e), language = %language, "Failed to run snippet");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
    }
}

#[derive(Default)]
struct CapturedOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
}

impl CapturedOutput {
    fn into_result(self, is_error: bool, timed_out: bool) -> ExecutionResult {
        ExecutionResult {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            combined: String::from_utf8_lossy(&self.combined).into_owned(),
            is_error,
            timed_out,
            killed_by_container: timed_out,
        }
    }
}

/// Runs one snippet in a private scratch directory under `work_dir`.
pub async fn run_snippet(
    work_dir: &std::path::Path,
    interpreter: Interpreter,
    code: &str,
    timeout: Duration,
) -> Result<ExecutionResult> {
    let scratch = tempfile::Builder::new()
        .prefix("job-")
        .tempdir_in(work_dir)
        .context("Failed to create scratch directory")?;
    let file = scratch.path().join(format!("code{}", interpreter.extension));
    tokio::fs::write(&file, code)
        .await
        .context("Failed to write code file")?;

    info!(program = interpreter.program, file = %file.display(), "Running snippet");
    let mut child = Command::new(interpreter.program)
        .args(interpreter.args)
        .arg(&file)
        .current_dir(scratch.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", interpreter.program))?;

    let mut stdout = child.stdout.take().context("stdout not captured")?;
    let mut stderr = child.stderr.take().context("stderr not captured")?;
    let mut output = CapturedOutput::default();
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let (mut out_open, mut err_open) = (true, true);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    // Drain both pipes until they close or the deadline passes.
    let mut timed_out = loop {
        if !out_open && !err_open {
            break false;
        }
        tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => {
                    output.stdout.extend_from_slice(&out_buf[..n]);
                    output.combined.extend_from_slice(&out_buf[..n]);
                }
            },
            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => {
                    output.stderr.extend_from_slice(&err_buf[..n]);
                    output.combined.extend_from_slice(&err_buf[..n]);
                }
            },
            _ = &mut deadline => break true,
        }
    };

    let mut exit_status = None;
    if !timed_out {
        tokio::select! {
            status = child.wait() => exit_status = Some(status.context("Failed to wait for snippet")?),
            _ = &mut deadline => timed_out = true,
        }
    }

    if timed_out {
        warn!(timeout_ms = timeout.as_millis() as u64, "Process timed out. Killing");
        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill timed out process");
        }
        return Ok(output.into_result(true, true));
    }

    let is_error = !exit_status.map(|s| s.success()).unwrap_or(false);
    Ok(output.into_result(is_error, false))
}
