// Postgres-backed stores for task definitions and execution logs

use super::{ExecutionStore, StatsAggregate, TaskStore};
use crate::errors::StoreError;
use crate::models::{
    ExecutionLog, ExecutionOutcome, ExecutionStatus, LogPage, NewTask, TaskDefinition, TaskStatus,
    TaskUpdate,
};
use crate::store::DbPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

const TASK_COLUMNS: &str = r#"
    id, name, description, cron_expression, timezone, command, parameters,
    working_directory, environment_vars, timeout_seconds, max_retries,
    retry_interval_seconds, priority, is_active, status,
    run_count, success_count, error_count,
    last_run_at, last_success_at, last_error_at, next_run_at,
    created_at, updated_at, deleted_at
"#;

const LOG_COLUMNS: &str = r#"
    execution_id, task_id, task_name, trigger_type, status,
    started_at, finished_at, duration_ms, exit_code,
    output, error_output, error_message,
    retry_count, is_retry, parent_execution_id,
    peak_cpu_percent, peak_memory_mb, created_at
"#;

/// Task definition repository over the `cron_tasks` table.
pub struct PgTaskStore {
    pool: DbPool,
}

impl PgTaskStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn to_json_value<T: serde::Serialize>(value: &Option<T>) -> Result<Option<serde_json::Value>, StoreError> {
    value
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::QueryFailed(format!("Failed to serialize JSON column: {}", e)))
}

#[async_trait]
impl TaskStore for PgTaskStore {
    #[instrument(skip(self))]
    async fn load_active(&self) -> Result<Vec<TaskDefinition>, StoreError> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM cron_tasks \
             WHERE is_active = true AND deleted_at IS NULL \
             ORDER BY priority DESC, id"
        );
        let tasks = sqlx::query_as::<_, TaskDefinition>(&query)
            .fetch_all(self.pool.pool())
            .await?;

        tracing::debug!(count = tasks.len(), "Loaded active task definitions");
        Ok(tasks)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, task_id: i64) -> Result<Option<TaskDefinition>, StoreError> {
        let query =
            format!("SELECT {TASK_COLUMNS} FROM cron_tasks WHERE id = $1 AND deleted_at IS NULL");
        let task = sqlx::query_as::<_, TaskDefinition>(&query)
            .bind(task_id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(task)
    }

    #[instrument(skip(self, task), fields(task_name = %task.name))]
    async fn create(&self, task: &NewTask) -> Result<TaskDefinition, StoreError> {
        let query = format!(
            r#"
            INSERT INTO cron_tasks (
                name, description, cron_expression, timezone, command, parameters,
                working_directory, environment_vars, timeout_seconds, max_retries,
                retry_interval_seconds, priority, is_active, status,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'enabled', NOW(), NOW())
            RETURNING {TASK_COLUMNS}
            "#
        );
        let created = sqlx::query_as::<_, TaskDefinition>(&query)
            .bind(&task.name)
            .bind(&task.description)
            .bind(&task.cron_expression)
            .bind(&task.timezone)
            .bind(&task.command)
            .bind(to_json_value(&task.parameters)?)
            .bind(&task.working_directory)
            .bind(to_json_value(&task.environment_vars)?)
            .bind(task.timeout_seconds)
            .bind(task.max_retries)
            .bind(task.retry_interval_seconds)
            .bind(task.priority)
            .bind(task.is_active)
            .fetch_one(self.pool.pool())
            .await?;

        tracing::info!(task_id = created.id, task_name = %created.name, "Task created");
        Ok(created)
    }

    #[instrument(skip(self, update))]
    async fn update(
        &self,
        task_id: i64,
        update: &TaskUpdate,
    ) -> Result<TaskDefinition, StoreError> {
        // Unset fields keep their current value; partial updates cannot
        // null a column.
        let query = format!(
            r#"
            UPDATE cron_tasks SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                cron_expression = COALESCE($4, cron_expression),
                timezone = COALESCE($5, timezone),
                command = COALESCE($6, command),
                parameters = COALESCE($7, parameters),
                working_directory = COALESCE($8, working_directory),
                environment_vars = COALESCE($9, environment_vars),
                timeout_seconds = COALESCE($10, timeout_seconds),
                max_retries = COALESCE($11, max_retries),
                retry_interval_seconds = COALESCE($12, retry_interval_seconds),
                priority = COALESCE($13, priority),
                is_active = COALESCE($14, is_active),
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING {TASK_COLUMNS}
            "#
        );
        let updated = sqlx::query_as::<_, TaskDefinition>(&query)
            .bind(task_id)
            .bind(&update.name)
            .bind(&update.description)
            .bind(&update.cron_expression)
            .bind(&update.timezone)
            .bind(&update.command)
            .bind(to_json_value(&update.parameters)?)
            .bind(&update.working_directory)
            .bind(to_json_value(&update.environment_vars)?)
            .bind(update.timeout_seconds)
            .bind(update.max_retries)
            .bind(update.retry_interval_seconds)
            .bind(update.priority)
            .bind(update.is_active)
            .fetch_optional(self.pool.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Task not found: {}", task_id)))?;

        tracing::info!(task_id, "Task updated");
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn set_status(&self, task_id: i64, status: TaskStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE cron_tasks SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(task_id)
        .bind(status.to_string())
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Task not found: {}", task_id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_active(&self, task_id: i64, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE cron_tasks SET is_active = $2, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(task_id)
        .bind(active)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Task not found: {}", task_id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_next_run(
        &self,
        task_id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE cron_tasks SET next_run_at = $2 WHERE id = $1 AND deleted_at IS NULL")
            .bind(task_id)
            .bind(next_run_at)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn record_result(
        &self,
        task_id: i64,
        success: bool,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE cron_tasks SET
                run_count = run_count + 1,
                success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                error_count = error_count + CASE WHEN $2 THEN 0 ELSE 1 END,
                last_run_at = $3,
                last_success_at = CASE WHEN $2 THEN $3 ELSE last_success_at END,
                last_error_at = CASE WHEN $2 THEN last_error_at ELSE $3 END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(success)
        .bind(finished_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset_running(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE cron_tasks SET status = 'enabled', updated_at = NOW() \
             WHERE status = 'running' AND deleted_at IS NULL",
        )
        .execute(self.pool.pool())
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::warn!(count, "Reset tasks stuck in running status from a previous run");
        }
        Ok(count)
    }

    #[instrument(skip(self))]
    async fn soft_delete(&self, task_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE cron_tasks SET deleted_at = NOW(), is_active = false, \
             status = 'disabled', updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(task_id)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn hard_delete(&self, task_id: i64) -> Result<bool, StoreError> {
        // Only tombstoned rows may be dropped for good.
        let result = sqlx::query("DELETE FROM cron_tasks WHERE id = $1 AND deleted_at IS NOT NULL")
            .bind(task_id)
            .execute(self.pool.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Execution history repository over the `cron_task_logs` table.
pub struct PgExecutionStore {
    pool: DbPool,
}

impl PgExecutionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    #[instrument(skip(self, log), fields(execution_id = %log.execution_id, task_id = log.task_id))]
    async fn insert(&self, log: &ExecutionLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cron_task_logs (
                execution_id, task_id, task_name, trigger_type, status,
                started_at, finished_at, duration_ms, exit_code,
                output, error_output, error_message,
                retry_count, is_retry, parent_execution_id,
                peak_cpu_percent, peak_memory_mb, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(log.execution_id)
        .bind(log.task_id)
        .bind(&log.task_name)
        .bind(log.trigger_type.to_string())
        .bind(log.status.to_string())
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(log.duration_ms)
        .bind(log.exit_code)
        .bind(&log.output)
        .bind(&log.error_output)
        .bind(&log.error_message)
        .bind(log.retry_count)
        .bind(log.is_retry)
        .bind(log.parent_execution_id)
        .bind(log.peak_cpu_percent)
        .bind(log.peak_memory_mb)
        .bind(log.created_at)
        .execute(self.pool.pool())
        .await?;

        tracing::debug!("Execution log row created");
        Ok(())
    }

    #[instrument(skip(self, outcome), fields(status = %outcome.status))]
    async fn seal(
        &self,
        execution_id: Uuid,
        outcome: &ExecutionOutcome,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cron_task_logs SET
                status = $2,
                finished_at = $3,
                duration_ms = $4,
                exit_code = $5,
                output = $6,
                error_output = $7,
                error_message = $8,
                retry_count = $9,
                peak_cpu_percent = $10,
                peak_memory_mb = $11
            WHERE execution_id = $1 AND status = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(outcome.status.to_string())
        .bind(outcome.finished_at)
        .bind(outcome.duration_ms)
        .bind(outcome.exit_code)
        .bind(&outcome.output)
        .bind(&outcome.error_output)
        .bind(&outcome.error_message)
        .bind(outcome.retry_count)
        .bind(outcome.peak_cpu_percent)
        .bind(outcome.peak_memory_mb)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "Running execution not found: {}",
                execution_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, execution_id: Uuid) -> Result<Option<ExecutionLog>, StoreError> {
        let query = format!("SELECT {LOG_COLUMNS} FROM cron_task_logs WHERE execution_id = $1");
        let log = sqlx::query_as::<_, ExecutionLog>(&query)
            .bind(execution_id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(log)
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        task_id: i64,
        page: u32,
        page_size: u32,
        status: Option<ExecutionStatus>,
    ) -> Result<LogPage, StoreError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let offset = (page - 1) as i64 * page_size as i64;
        let status_str = status.map(|s| s.to_string());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM cron_task_logs \
             WHERE task_id = $1 AND ($2::text IS NULL OR status = $2)",
        )
        .bind(task_id)
        .bind(&status_str)
        .fetch_one(self.pool.pool())
        .await?;

        let query = format!(
            "SELECT {LOG_COLUMNS} FROM cron_task_logs \
             WHERE task_id = $1 AND ($2::text IS NULL OR status = $2) \
             ORDER BY started_at DESC LIMIT $3 OFFSET $4"
        );
        let logs = sqlx::query_as::<_, ExecutionLog>(&query)
            .bind(task_id)
            .bind(&status_str)
            .bind(page_size as i64)
            .bind(offset)
            .fetch_all(self.pool.pool())
            .await?;

        let total_pages = ((total as u64 + page_size as u64 - 1) / page_size as u64) as u32;
        Ok(LogPage {
            logs,
            total,
            page,
            page_size,
            total_pages,
        })
    }

    #[instrument(skip(self))]
    async fn aggregate_stats(&self) -> Result<Vec<StatsAggregate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                task_id,
                COUNT(*) AS total_executions,
                COUNT(*) FILTER (WHERE status = 'success') AS success_count,
                COUNT(*) FILTER (WHERE status <> 'success') AS error_count,
                COALESCE(SUM(duration_ms), 0) AS total_duration_ms,
                MIN(duration_ms) AS min_duration_ms,
                MAX(duration_ms) AS max_duration_ms,
                MAX(started_at) AS last_execution_at
            FROM cron_task_logs
            WHERE finished_at IS NOT NULL
            GROUP BY task_id
            "#,
        )
        .fetch_all(self.pool.pool())
        .await?;

        let mut aggregates = Vec::with_capacity(rows.len());
        for row in rows {
            aggregates.push(StatsAggregate {
                task_id: row.try_get("task_id")?,
                total_executions: row.try_get("total_executions")?,
                success_count: row.try_get("success_count")?,
                error_count: row.try_get("error_count")?,
                total_duration_ms: row.try_get("total_duration_ms")?,
                min_duration_ms: row.try_get("min_duration_ms")?,
                max_duration_ms: row.try_get("max_duration_ms")?,
                last_execution_at: row.try_get("last_execution_at")?,
            });
        }
        Ok(aggregates)
    }

    #[instrument(skip(self))]
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM cron_task_logs WHERE started_at < $1")
            .bind(cutoff)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
