// Persistence seam for task definitions and execution history
//
// The scheduler core only ever talks to these traits; the Postgres
// implementations live in `postgres.rs` and tests substitute in-memory
// doubles.

pub mod memory;
pub mod pool;
pub mod postgres;

pub use memory::{MemoryExecutionStore, MemoryTaskStore};
pub use pool::DbPool;
pub use postgres::{PgExecutionStore, PgTaskStore};

use crate::errors::StoreError;
use crate::models::{
    ExecutionLog, ExecutionOutcome, ExecutionStatus, LogPage, NewTask, TaskDefinition, TaskStatus,
    TaskUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Durable statistics for one task, used to rebuild the monitor's in-memory
/// cache after a restart.
#[derive(Debug, Clone)]
pub struct StatsAggregate {
    pub task_id: i64,
    pub total_executions: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub total_duration_ms: i64,
    pub min_duration_ms: Option<i64>,
    pub max_duration_ms: Option<i64>,
    pub last_execution_at: Option<DateTime<Utc>>,
}

/// Store of task definitions. Soft-deleted rows are invisible to every read
/// except `hard_delete`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// All active, non-deleted definitions, for the startup load.
    async fn load_active(&self) -> Result<Vec<TaskDefinition>, StoreError>;

    async fn find_by_id(&self, task_id: i64) -> Result<Option<TaskDefinition>, StoreError>;

    async fn create(&self, task: &NewTask) -> Result<TaskDefinition, StoreError>;

    async fn update(&self, task_id: i64, update: &TaskUpdate)
        -> Result<TaskDefinition, StoreError>;

    async fn set_status(&self, task_id: i64, status: TaskStatus) -> Result<(), StoreError>;

    async fn set_active(&self, task_id: i64, active: bool) -> Result<(), StoreError>;

    async fn update_next_run(
        &self,
        task_id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Bump run/success/error counters and last-run stamps after an execution.
    async fn record_result(
        &self,
        task_id: i64,
        success: bool,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Crash recovery: reset every definition stuck in `running` back to
    /// `enabled`. Returns the number of rows touched.
    async fn reset_running(&self) -> Result<u64, StoreError>;

    /// Tombstone a definition. Returns false when it does not exist.
    async fn soft_delete(&self, task_id: i64) -> Result<bool, StoreError>;

    /// Irreversibly drop a definition. Only legal on a soft-deleted row;
    /// returns false otherwise.
    async fn hard_delete(&self, task_id: i64) -> Result<bool, StoreError>;
}

/// Append-only store of execution history.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, log: &ExecutionLog) -> Result<(), StoreError>;

    /// Seal a `running` row to its terminal state. The row is mutated in
    /// place, never deleted.
    async fn seal(&self, execution_id: Uuid, outcome: &ExecutionOutcome)
        -> Result<(), StoreError>;

    async fn find_by_id(&self, execution_id: Uuid) -> Result<Option<ExecutionLog>, StoreError>;

    /// Paginated history for one task, newest first.
    async fn list(
        &self,
        task_id: i64,
        page: u32,
        page_size: u32,
        status: Option<ExecutionStatus>,
    ) -> Result<LogPage, StoreError>;

    /// Aggregates over sealed executions, for the monitor rebuild.
    async fn aggregate_stats(&self) -> Result<Vec<StatsAggregate>, StoreError>;

    /// Retention sweep: drop every log that started before the cutoff.
    /// Returns the number of rows deleted.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
