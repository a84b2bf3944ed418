// In-memory store backend for tests and local development

use super::{ExecutionStore, StatsAggregate, TaskStore};
use crate::errors::StoreError;
use crate::models::{
    ExecutionLog, ExecutionOutcome, ExecutionStatus, LogPage, NewTask, TaskDefinition, TaskStatus,
    TaskUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tasks {
    next_id: i64,
    by_id: HashMap<i64, TaskDefinition>,
}

/// Task store holding definitions in a map. Mirrors the Postgres backend's
/// semantics, including soft-delete visibility rules.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Tasks>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tasks> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn visible(task: &TaskDefinition) -> bool {
    task.deleted_at.is_none()
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load_active(&self) -> Result<Vec<TaskDefinition>, StoreError> {
        let inner = self.lock();
        let mut tasks: Vec<TaskDefinition> = inner
            .by_id
            .values()
            .filter(|t| t.is_active && visible(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn find_by_id(&self, task_id: i64) -> Result<Option<TaskDefinition>, StoreError> {
        let inner = self.lock();
        Ok(inner.by_id.get(&task_id).filter(|t| visible(t)).cloned())
    }

    async fn create(&self, task: &NewTask) -> Result<TaskDefinition, StoreError> {
        let mut inner = self.lock();
        if inner.by_id.values().any(|t| t.name == task.name && visible(t)) {
            return Err(StoreError::DuplicateKey(format!(
                "Task name already exists: {}",
                task.name
            )));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let now = Utc::now();
        let definition = TaskDefinition {
            id,
            name: task.name.clone(),
            description: task.description.clone(),
            cron_expression: task.cron_expression.clone(),
            timezone: task.timezone.clone(),
            command: task.command.clone(),
            parameters: task.parameters.clone(),
            working_directory: task.working_directory.clone(),
            environment_vars: task.environment_vars.clone(),
            timeout_seconds: task.timeout_seconds,
            max_retries: task.max_retries,
            retry_interval_seconds: task.retry_interval_seconds,
            priority: task.priority,
            is_active: task.is_active,
            status: TaskStatus::Enabled,
            run_count: 0,
            success_count: 0,
            error_count: 0,
            last_run_at: None,
            last_success_at: None,
            last_error_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        inner.by_id.insert(id, definition.clone());
        Ok(definition)
    }

    async fn update(
        &self,
        task_id: i64,
        update: &TaskUpdate,
    ) -> Result<TaskDefinition, StoreError> {
        let mut inner = self.lock();
        let task = inner
            .by_id
            .get_mut(&task_id)
            .filter(|t| visible(t))
            .ok_or_else(|| StoreError::NotFound(format!("Task not found: {}", task_id)))?;

        if let Some(v) = &update.name {
            task.name = v.clone();
        }
        if let Some(v) = &update.description {
            task.description = Some(v.clone());
        }
        if let Some(v) = &update.cron_expression {
            task.cron_expression = v.clone();
        }
        if let Some(v) = &update.timezone {
            task.timezone = v.clone();
        }
        if let Some(v) = &update.command {
            task.command = v.clone();
        }
        if let Some(v) = &update.parameters {
            task.parameters = Some(v.clone());
        }
        if let Some(v) = &update.working_directory {
            task.working_directory = Some(v.clone());
        }
        if let Some(v) = &update.environment_vars {
            task.environment_vars = Some(v.clone());
        }
        if let Some(v) = update.timeout_seconds {
            task.timeout_seconds = v;
        }
        if let Some(v) = update.max_retries {
            task.max_retries = v;
        }
        if let Some(v) = update.retry_interval_seconds {
            task.retry_interval_seconds = v;
        }
        if let Some(v) = update.priority {
            task.priority = v;
        }
        if let Some(v) = update.is_active {
            task.is_active = v;
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn set_status(&self, task_id: i64, status: TaskStatus) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let task = inner
            .by_id
            .get_mut(&task_id)
            .filter(|t| visible(t))
            .ok_or_else(|| StoreError::NotFound(format!("Task not found: {}", task_id)))?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_active(&self, task_id: i64, active: bool) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let task = inner
            .by_id
            .get_mut(&task_id)
            .filter(|t| visible(t))
            .ok_or_else(|| StoreError::NotFound(format!("Task not found: {}", task_id)))?;
        task.is_active = active;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn update_next_run(
        &self,
        task_id: i64,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(task) = inner.by_id.get_mut(&task_id).filter(|t| visible(t)) {
            task.next_run_at = next_run_at;
        }
        Ok(())
    }

    async fn record_result(
        &self,
        task_id: i64,
        success: bool,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(task) = inner.by_id.get_mut(&task_id) {
            task.run_count += 1;
            task.last_run_at = Some(finished_at);
            if success {
                task.success_count += 1;
                task.last_success_at = Some(finished_at);
            } else {
                task.error_count += 1;
                task.last_error_at = Some(finished_at);
            }
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn reset_running(&self) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let mut count = 0u64;
        for task in inner.by_id.values_mut() {
            if task.status == TaskStatus::Running && visible(task) {
                task.status = TaskStatus::Enabled;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn soft_delete(&self, task_id: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.by_id.get_mut(&task_id).filter(|t| visible(t)) {
            Some(task) => {
                task.deleted_at = Some(Utc::now());
                task.is_active = false;
                task.status = TaskStatus::Disabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hard_delete(&self, task_id: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.by_id.get(&task_id) {
            Some(task) if task.deleted_at.is_some() => {
                inner.by_id.remove(&task_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Execution store holding log rows in a vector.
#[derive(Default)]
pub struct MemoryExecutionStore {
    logs: Mutex<Vec<ExecutionLog>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ExecutionLog>> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All rows, for assertions.
    pub fn snapshot(&self) -> Vec<ExecutionLog> {
        self.lock().clone()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, log: &ExecutionLog) -> Result<(), StoreError> {
        let mut logs = self.lock();
        if logs.iter().any(|l| l.execution_id == log.execution_id) {
            return Err(StoreError::DuplicateKey(format!(
                "Execution already exists: {}",
                log.execution_id
            )));
        }
        logs.push(log.clone());
        Ok(())
    }

    async fn seal(
        &self,
        execution_id: Uuid,
        outcome: &ExecutionOutcome,
    ) -> Result<(), StoreError> {
        let mut logs = self.lock();
        let log = logs
            .iter_mut()
            .find(|l| l.execution_id == execution_id && l.status == ExecutionStatus::Running)
            .ok_or_else(|| {
                StoreError::NotFound(format!("Running execution not found: {}", execution_id))
            })?;
        log.status = outcome.status;
        log.finished_at = Some(outcome.finished_at);
        log.duration_ms = Some(outcome.duration_ms);
        log.exit_code = outcome.exit_code;
        log.output = outcome.output.clone();
        log.error_output = outcome.error_output.clone();
        log.error_message = outcome.error_message.clone();
        log.retry_count = outcome.retry_count;
        log.peak_cpu_percent = outcome.peak_cpu_percent;
        log.peak_memory_mb = outcome.peak_memory_mb;
        Ok(())
    }

    async fn find_by_id(&self, execution_id: Uuid) -> Result<Option<ExecutionLog>, StoreError> {
        Ok(self
            .lock()
            .iter()
            .find(|l| l.execution_id == execution_id)
            .cloned())
    }

    async fn list(
        &self,
        task_id: i64,
        page: u32,
        page_size: u32,
        status: Option<ExecutionStatus>,
    ) -> Result<LogPage, StoreError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let logs = self.lock();
        let mut matching: Vec<ExecutionLog> = logs
            .iter()
            .filter(|l| l.task_id == task_id && status.map_or(true, |s| l.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let total = matching.len() as i64;
        let total_pages = ((total as u64 + page_size as u64 - 1) / page_size as u64) as u32;
        let start = ((page - 1) * page_size) as usize;
        let page_logs = matching
            .into_iter()
            .skip(start)
            .take(page_size as usize)
            .collect();
        Ok(LogPage {
            logs: page_logs,
            total,
            page,
            page_size,
            total_pages,
        })
    }

    async fn aggregate_stats(&self) -> Result<Vec<StatsAggregate>, StoreError> {
        let logs = self.lock();
        let mut by_task: HashMap<i64, StatsAggregate> = HashMap::new();
        for log in logs.iter().filter(|l| l.finished_at.is_some()) {
            let duration = log.duration_ms.unwrap_or(0);
            let agg = by_task.entry(log.task_id).or_insert(StatsAggregate {
                task_id: log.task_id,
                total_executions: 0,
                success_count: 0,
                error_count: 0,
                total_duration_ms: 0,
                min_duration_ms: None,
                max_duration_ms: None,
                last_execution_at: None,
            });
            agg.total_executions += 1;
            if log.status == ExecutionStatus::Success {
                agg.success_count += 1;
            } else {
                agg.error_count += 1;
            }
            agg.total_duration_ms += duration;
            agg.min_duration_ms = Some(agg.min_duration_ms.map_or(duration, |m| m.min(duration)));
            agg.max_duration_ms = Some(agg.max_duration_ms.map_or(duration, |m| m.max(duration)));
            agg.last_execution_at = Some(
                agg.last_execution_at
                    .map_or(log.started_at, |at| at.max(log.started_at)),
            );
        }
        let mut aggregates: Vec<StatsAggregate> = by_task.into_values().collect();
        aggregates.sort_by_key(|a| a.task_id);
        Ok(aggregates)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut logs = self.lock();
        let before = logs.len();
        logs.retain(|l| l.started_at >= cutoff);
        Ok((before - logs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(name: &str) -> NewTask {
        NewTask {
            name: name.to_string(),
            description: None,
            cron_expression: "*/5 * * * *".to_string(),
            timezone: "UTC".to_string(),
            command: "echo hello".to_string(),
            parameters: None,
            working_directory: None,
            environment_vars: None,
            timeout_seconds: 300,
            max_retries: 3,
            retry_interval_seconds: 60,
            priority: 5,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_rejects_duplicate_names() {
        let store = MemoryTaskStore::new();
        let first = store.create(&new_task("a")).await.unwrap();
        let second = store.create(&new_task("b")).await.unwrap();
        assert!(second.id > first.id);
        assert!(matches!(
            store.create(&new_task("a")).await,
            Err(StoreError::DuplicateKey(_))
        ));
    }

    #[tokio::test]
    async fn test_soft_deleted_tasks_are_invisible_until_hard_deleted() {
        let store = MemoryTaskStore::new();
        let task = store.create(&new_task("a")).await.unwrap();
        assert!(store.soft_delete(task.id).await.unwrap());
        assert!(store.find_by_id(task.id).await.unwrap().is_none());
        assert!(store.load_active().await.unwrap().is_empty());
        // Hard delete only touches tombstoned rows.
        assert!(store.hard_delete(task.id).await.unwrap());
        assert!(!store.hard_delete(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_result_bumps_counters() {
        let store = MemoryTaskStore::new();
        let task = store.create(&new_task("a")).await.unwrap();
        let now = Utc::now();
        store.record_result(task.id, true, now).await.unwrap();
        store.record_result(task.id, false, now).await.unwrap();
        let task = store.find_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(task.run_count, 2);
        assert_eq!(task.success_count, 1);
        assert_eq!(task.error_count, 1);
        assert_eq!(task.last_error_at, Some(now));
    }

    #[tokio::test]
    async fn test_list_paginates_newest_first() {
        let store = MemoryExecutionStore::new();
        for _ in 0..5 {
            let log = ExecutionLog::started(
                Uuid::new_v4(),
                1,
                "t".to_string(),
                crate::models::TriggerType::Scheduled,
            );
            store.insert(&log).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let page = store.list(1, 1, 2, None).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.logs.len(), 2);
        assert!(page.logs[0].started_at >= page.logs[1].started_at);
    }

    #[tokio::test]
    async fn test_delete_older_than_keeps_recent_logs() {
        let store = MemoryExecutionStore::new();
        let mut old_log = ExecutionLog::started(
            Uuid::new_v4(),
            1,
            "t".to_string(),
            crate::models::TriggerType::Scheduled,
        );
        old_log.started_at = Utc::now() - chrono::Duration::days(40);
        let fresh = ExecutionLog::started(
            Uuid::new_v4(),
            1,
            "t".to_string(),
            crate::models::TriggerType::Scheduled,
        );
        store.insert(&old_log).await.unwrap();
        store.insert(&fresh).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        assert_eq!(store.delete_older_than(cutoff).await.unwrap(), 1);
        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.snapshot()[0].execution_id, fresh.execution_id);
    }
}
