use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Task definition models
// ============================================================================

/// TaskDefinition is the persisted description of a recurring job.
///
/// The store is the source of truth; the scheduler's live registry is a
/// rebuildable cache derived from rows where `is_active` is set and
/// `deleted_at` is null.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDefinition {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    /// IANA timezone name the cron expression is evaluated in.
    pub timezone: String,
    pub command: String,
    #[sqlx(json(nullable))]
    pub parameters: Option<HashMap<String, serde_json::Value>>,
    pub working_directory: Option<String>,
    #[sqlx(json(nullable))]
    pub environment_vars: Option<HashMap<String, String>>,
    pub timeout_seconds: i32,
    pub max_retries: i32,
    pub retry_interval_seconds: i32,
    pub priority: i32,
    pub is_active: bool,
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    pub run_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Payload for creating a task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub command: String,
    #[serde(default)]
    pub parameters: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment_vars: Option<HashMap<String, String>>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_retry_interval_seconds")]
    pub retry_interval_seconds: i32,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Partial update for a task definition; unset fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub command: Option<String>,
    pub parameters: Option<HashMap<String, serde_json::Value>>,
    pub working_directory: Option<String>,
    pub environment_vars: Option<HashMap<String, String>>,
    pub timeout_seconds: Option<i32>,
    pub max_retries: Option<i32>,
    pub retry_interval_seconds: Option<i32>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_timeout_seconds() -> i32 {
    300
}

fn default_max_retries() -> i32 {
    3
}

fn default_retry_interval_seconds() -> i32 {
    60
}

fn default_priority() -> i32 {
    5
}

fn default_true() -> bool {
    true
}

/// TaskStatus is the lifecycle state of a task definition.
///
/// `Running` is transient: the scheduler reconciles it back to `Enabled` or
/// `Error` when the execution finishes, and `start()` resets any row left in
/// `Running` by a crashed process. `Disabled` is only entered through explicit
/// deactivation, never by the executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Enabled,
    Disabled,
    Running,
    Error,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Enabled => write!(f, "enabled"),
            TaskStatus::Disabled => write!(f, "disabled"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(TaskStatus::Enabled),
            "disabled" => Ok(TaskStatus::Disabled),
            "running" => Ok(TaskStatus::Running),
            "error" => Ok(TaskStatus::Error),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        Self::from_str(&s)
    }
}

// ============================================================================
// Execution models
// ============================================================================

/// ExecutionStatus is the state of one execution attempt group.
///
/// `Running → {Success, Error, Timeout, Cancelled}`; the four terminal states
/// are final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Error => write!(f, "error"),
            ExecutionStatus::Timeout => write!(f, "timeout"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "error" => Ok(ExecutionStatus::Error),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

impl TryFrom<String> for ExecutionStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        Self::from_str(&s)
    }
}

/// TriggerType records how an execution was initiated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::Scheduled => write!(f, "scheduled"),
            TriggerType::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerType::Scheduled),
            "manual" => Ok(TriggerType::Manual),
            _ => Err(format!("Invalid trigger type: {}", s)),
        }
    }
}

impl TryFrom<String> for TriggerType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        Self::from_str(&s)
    }
}

/// ExecutionLog is one append-only row in the execution history.
///
/// The task name is denormalized at insert time so history survives renames.
/// All in-process retries stay inside a single row (`retry_count` reflects
/// the total attempts); `is_retry`/`parent_execution_id` link manual re-runs
/// recorded by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionLog {
    pub execution_id: Uuid,
    pub task_id: i64,
    pub task_name: String,
    #[sqlx(try_from = "String")]
    pub trigger_type: TriggerType,
    #[sqlx(try_from = "String")]
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub is_retry: bool,
    pub parent_execution_id: Option<Uuid>,
    pub peak_cpu_percent: Option<f64>,
    pub peak_memory_mb: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionLog {
    /// Create a fresh `running` row for an execution that is about to start.
    pub fn started(
        execution_id: Uuid,
        task_id: i64,
        task_name: String,
        trigger_type: TriggerType,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            task_id,
            task_name,
            trigger_type,
            status: ExecutionStatus::Running,
            started_at: now,
            finished_at: None,
            duration_ms: None,
            exit_code: None,
            output: None,
            error_output: None,
            error_message: None,
            retry_count: 0,
            is_retry: false,
            parent_execution_id: None,
            peak_cpu_percent: None,
            peak_memory_mb: None,
            created_at: now,
        }
    }
}

/// Terminal outcome used to seal a `running` execution row.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error_output: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub peak_cpu_percent: Option<f64>,
    pub peak_memory_mb: Option<f64>,
}

// ============================================================================
// Statistics and registry snapshots
// ============================================================================

/// Rolling per-task counters kept in memory by the execution monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_executions: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub missed_count: u64,
    pub total_duration_ms: i64,
    pub avg_duration_ms: i64,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub last_status: Option<ExecutionStatus>,
}

impl TaskStats {
    pub fn record(&mut self, status: ExecutionStatus, duration_ms: i64, at: DateTime<Utc>) {
        self.total_executions += 1;
        if status == ExecutionStatus::Success {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
        self.total_duration_ms += duration_ms;
        self.avg_duration_ms = self.total_duration_ms / self.total_executions as i64;
        self.min_duration_ms = Some(match self.min_duration_ms {
            Some(min) => min.min(duration_ms),
            None => duration_ms,
        });
        self.max_duration_ms = Some(match self.max_duration_ms {
            Some(max) => max.max(duration_ms),
            None => duration_ms,
        });
        self.last_execution_at = Some(at);
        self.last_status = Some(status);
    }
}

/// Read-only snapshot of one live registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: i64,
    pub job_id: String,
    pub name: String,
    pub next_run_time: Option<DateTime<Utc>>,
    pub trigger_description: String,
    pub paused: bool,
}

/// Aggregated scheduler status returned to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub is_running: bool,
    pub total_tasks: usize,
    pub scheduler_state: String,
    pub tasks: HashMap<i64, TaskStats>,
}

/// One page of execution history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub logs: Vec<ExecutionLog>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_round_trip() {
        for status in [
            TaskStatus::Enabled,
            TaskStatus::Disabled,
            TaskStatus::Running,
            TaskStatus::Error,
        ] {
            let parsed = TaskStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_execution_status_round_trip() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Error,
            ExecutionStatus::Timeout,
            ExecutionStatus::Cancelled,
        ] {
            let parsed = ExecutionStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_invalid_status_rejected() {
        assert!(TaskStatus::from_str("paused").is_err());
        assert!(ExecutionStatus::from_str("dead_letter").is_err());
        assert!(TriggerType::from_str("webhook").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_new_task_defaults() {
        let task: NewTask = serde_json::from_value(serde_json::json!({
            "name": "nightly-sync",
            "cron_expression": "0 2 * * *",
            "command": "sync-orders",
        }))
        .unwrap();
        assert_eq!(task.timezone, "UTC");
        assert_eq!(task.timeout_seconds, 300);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_interval_seconds, 60);
        assert_eq!(task.priority, 5);
        assert!(task.is_active);
    }

    #[test]
    fn test_task_stats_record() {
        let mut stats = TaskStats::default();
        let now = Utc::now();
        stats.record(ExecutionStatus::Success, 100, now);
        stats.record(ExecutionStatus::Error, 300, now);
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.avg_duration_ms, 200);
        assert_eq!(stats.min_duration_ms, Some(100));
        assert_eq!(stats.max_duration_ms, Some(300));
        assert_eq!(stats.last_status, Some(ExecutionStatus::Error));
    }
}
