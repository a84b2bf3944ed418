// Task command execution with timeout, retry, and resource tracking

pub mod command;
pub mod sampler;

pub use command::CommandLine;
pub use sampler::{ResourcePeaks, ResourceSampler};

use crate::config::ExecutorConfig;
use crate::errors::ExecutionError;
use crate::models::{ExecutionOutcome, ExecutionStatus, TaskDefinition};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Environment marker set for every child so task scripts can tell a
/// scheduled run from a manual shell invocation.
pub const EXECUTION_ENV_MARKER: &str = "CRON_TASK_EXECUTION";

/// Everything the executor needs to run one task, resolved from the task
/// definition with executor defaults filled in.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: i64,
    pub task_name: String,
    pub command: String,
    pub parameters: Option<HashMap<String, serde_json::Value>>,
    pub working_directory: Option<String>,
    pub environment_vars: Option<HashMap<String, String>>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_interval_seconds: u64,
}

impl ExecutionRequest {
    pub fn from_task(task: &TaskDefinition, config: &ExecutorConfig) -> Self {
        Self {
            task_id: task.id,
            task_name: task.name.clone(),
            command: task.command.clone(),
            parameters: task.parameters.clone(),
            working_directory: task.working_directory.clone(),
            environment_vars: task.environment_vars.clone(),
            timeout_seconds: positive_or(task.timeout_seconds, config.default_timeout_seconds),
            max_retries: non_negative_or(task.max_retries, config.default_max_retries),
            retry_interval_seconds: positive_or(
                task.retry_interval_seconds,
                config.default_retry_interval_seconds,
            ),
        }
    }
}

fn positive_or(value: i32, fallback: u64) -> u64 {
    if value > 0 {
        value as u64
    } else {
        fallback
    }
}

fn non_negative_or(value: i32, fallback: u32) -> u32 {
    if value >= 0 {
        value as u32
    } else {
        fallback
    }
}

/// Terminal result of one execution, after all retry attempts.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub error_message: Option<String>,
    /// Total attempts run, including the first.
    pub retry_count: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub peak_cpu_percent: Option<f64>,
    pub peak_memory_mb: Option<f64>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn into_outcome(self) -> ExecutionOutcome {
        ExecutionOutcome {
            status: self.status,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
            exit_code: self.exit_code,
            output: self.output,
            error_output: self.error_output,
            error_message: self.error_message,
            retry_count: self.retry_count,
            peak_cpu_percent: self.peak_cpu_percent,
            peak_memory_mb: self.peak_memory_mb,
        }
    }
}

/// Result of one spawn attempt, before retry policy is applied.
struct AttemptResult {
    status: ExecutionStatus,
    exit_code: Option<i32>,
    output: Option<String>,
    error_output: Option<String>,
    error_message: Option<String>,
    peaks: ResourcePeaks,
    retriable: bool,
}

/// Runs task commands as child processes. Never returns an error itself;
/// every failure mode is folded into the `ExecutionResult` so the caller
/// always has something to record.
pub struct TaskExecutor {
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    #[instrument(skip(self, request, cancel), fields(task_id = request.task_id, task_name = %request.task_name))]
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let start = std::time::Instant::now();
        // Attempts actually run, reported as the row's retry_count.
        let mut attempts: u32 = 1;

        let final_attempt = loop {
            let result = self.run_attempt(request, &cancel).await;

            if result.status == ExecutionStatus::Success || !result.retriable {
                break result;
            }
            if attempts > request.max_retries {
                tracing::warn!(
                    task_id = request.task_id,
                    attempts,
                    "Task failed after exhausting retries"
                );
                break result;
            }

            tracing::info!(
                task_id = request.task_id,
                attempts,
                max_retries = request.max_retries,
                retry_in_seconds = request.retry_interval_seconds,
                "Task attempt failed, scheduling retry"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    break AttemptResult {
                        status: ExecutionStatus::Cancelled,
                        exit_code: None,
                        output: result.output,
                        error_output: result.error_output,
                        error_message: Some(ExecutionError::Cancelled.to_string()),
                        peaks: result.peaks,
                        retriable: false,
                    };
                }
                _ = tokio::time::sleep(Duration::from_secs(request.retry_interval_seconds)) => {}
            }
            attempts += 1;
        };

        let finished_at = Utc::now();
        ExecutionResult {
            status: final_attempt.status,
            exit_code: final_attempt.exit_code,
            output: final_attempt.output,
            error_output: final_attempt.error_output,
            error_message: final_attempt.error_message,
            retry_count: attempts as i32,
            started_at,
            finished_at,
            duration_ms: start.elapsed().as_millis() as i64,
            peak_cpu_percent: final_attempt.peaks.peak_cpu_percent,
            peak_memory_mb: final_attempt.peaks.peak_memory_mb,
        }
    }

    async fn run_attempt(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> AttemptResult {
        let line = match CommandLine::build(&request.command, request.parameters.as_ref()) {
            Ok(line) => line,
            // Bad command shapes fail identically on every attempt, so they
            // skip the retry loop.
            Err(err) => return AttemptResult::rejected(err),
        };

        let mut cmd = Command::new(&line.program);
        cmd.args(&line.args)
            .env(EXECUTION_ENV_MARKER, "true")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_directory {
            // A bad working directory falls back to the process default
            // rather than failing the execution.
            if std::path::Path::new(dir).is_dir() {
                cmd.current_dir(dir);
            } else {
                tracing::warn!(
                    task_id = request.task_id,
                    working_directory = %dir,
                    "Working directory does not exist, using process default"
                );
            }
        }
        if let Some(env) = &request.environment_vars {
            cmd.envs(env);
        }

        tracing::debug!(task_id = request.task_id, command = %line.display(), "Spawning task process");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return AttemptResult::failed(
                    ExecutionError::SpawnFailed(e.to_string()).to_string(),
                )
            }
        };

        let cap = self.config.output_capture_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_capped(stdout, cap));
        let stderr_task = tokio::spawn(read_capped(stderr, cap));

        let sampler = child
            .id()
            .map(|pid| ResourceSampler::spawn(pid, request.task_id, &self.config));

        let timeout = Duration::from_secs(request.timeout_seconds);
        let (status, exit_code, error_message, retriable) = tokio::select! {
            wait = child.wait() => match wait {
                Ok(exit) if exit.success() => (ExecutionStatus::Success, exit.code(), None, false),
                Ok(exit) => (
                    ExecutionStatus::Error,
                    exit.code(),
                    Some(match exit.code() {
                        Some(code) => format!("Command exited with status {}", code),
                        None => "Command terminated by signal".to_string(),
                    }),
                    true,
                ),
                Err(e) => (
                    ExecutionStatus::Error,
                    None,
                    Some(format!("Failed to wait on command: {}", e)),
                    true,
                ),
            },
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    task_id = request.task_id,
                    timeout_seconds = request.timeout_seconds,
                    "Task execution timed out, killing process"
                );
                let _ = child.kill().await;
                (
                    ExecutionStatus::Timeout,
                    None,
                    Some(ExecutionError::Timeout(request.timeout_seconds).to_string()),
                    true,
                )
            }
            _ = cancel.cancelled() => {
                tracing::info!(task_id = request.task_id, "Task execution cancelled, killing process");
                let _ = child.kill().await;
                (
                    ExecutionStatus::Cancelled,
                    None,
                    Some(ExecutionError::Cancelled.to_string()),
                    false,
                )
            }
        };

        let output = stdout_task.await.ok().flatten();
        let error_output = stderr_task.await.ok().flatten();
        let peaks = match sampler {
            Some(sampler) => sampler.finish().await,
            None => ResourcePeaks::default(),
        };

        AttemptResult {
            status,
            exit_code,
            output,
            error_output,
            error_message,
            peaks,
            retriable,
        }
    }
}

impl AttemptResult {
    fn rejected(err: ExecutionError) -> Self {
        Self {
            status: ExecutionStatus::Error,
            exit_code: None,
            output: None,
            error_output: None,
            error_message: Some(err.to_string()),
            peaks: ResourcePeaks::default(),
            retriable: false,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            status: ExecutionStatus::Error,
            exit_code: None,
            output: None,
            error_output: None,
            error_message: Some(message),
            peaks: ResourcePeaks::default(),
            retriable: true,
        }
    }
}

/// Read a child stream to completion, keeping at most `cap` bytes. The
/// stream is drained past the cap so the child never blocks on a full pipe.
async fn read_capped<R>(stream: Option<R>, cap: usize) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut stream = stream?;
    let mut kept = Vec::with_capacity(1024);
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if kept.len() < cap {
                    let take = n.min(cap - kept.len());
                    kept.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    if kept.is_empty() {
        return None;
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str("\n... [output truncated]");
    }
    Some(text)
}
