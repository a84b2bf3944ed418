// Runtime activation and reload of task definitions

use crate::errors::{SchedulerError, StoreError};
use crate::models::{TaskDefinition, TaskStatus};
use crate::scheduler::SchedulerManager;
use crate::store::TaskStore;
use crate::trigger;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::instrument;

/// Flips tasks on and off a live scheduler without a restart. Activation
/// state lives in the store; this type keeps the registry in sync with it.
pub struct DynamicTaskManager {
    scheduler: Arc<SchedulerManager>,
    task_store: Arc<dyn TaskStore + Send + Sync>,
}

impl DynamicTaskManager {
    pub fn new(
        scheduler: Arc<SchedulerManager>,
        task_store: Arc<dyn TaskStore + Send + Sync>,
    ) -> Self {
        Self {
            scheduler,
            task_store,
        }
    }

    /// Mark a task active and put it on the schedule. Returns the next fire
    /// time. Activating an already-registered task reports its next fire
    /// time without replacing the registration.
    #[instrument(skip(self))]
    pub async fn activate_task(&self, task_id: i64) -> Result<DateTime<Utc>, SchedulerError> {
        let definition = self.fetch(task_id).await?;
        let next = next_fire(&definition)?;
        if self.scheduler.is_scheduled(task_id).await {
            return Ok(next);
        }
        self.task_store.set_active(task_id, true).await?;
        self.task_store.set_status(task_id, TaskStatus::Enabled).await?;
        self.scheduler.register_task(definition).await?;
        tracing::info!(task_id, next_run = %next, "Task activated");
        Ok(next)
    }

    /// Mark a task inactive and take it off the schedule. Idempotent;
    /// in-flight executions are left to finish.
    #[instrument(skip(self))]
    pub async fn deactivate_task(&self, task_id: i64) -> Result<(), SchedulerError> {
        match self.task_store.set_active(task_id, false).await {
            Ok(()) => {
                self.task_store
                    .set_status(task_id, TaskStatus::Disabled)
                    .await?;
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.scheduler.remove_task(task_id).await;
        tracing::info!(task_id, "Task deactivated");
        Ok(())
    }

    /// Re-read one task's definition from the store and reschedule it.
    /// An inactive definition drops the task from the registry instead.
    #[instrument(skip(self))]
    pub async fn reload_task(&self, task_id: i64) -> Result<(), SchedulerError> {
        let definition = self.fetch(task_id).await?;
        if definition.is_active {
            self.scheduler.register_task(definition).await?;
        } else {
            self.scheduler.remove_task(task_id).await;
        }
        tracing::info!(task_id, "Task definition reloaded");
        Ok(())
    }

    /// Re-read every active definition and replace the registry wholesale.
    /// Tasks no longer active in the store fall off the schedule.
    #[instrument(skip(self))]
    pub async fn reload_all(&self) -> Result<usize, SchedulerError> {
        let active = self.task_store.load_active().await?;
        let keep: Vec<i64> = active.iter().map(|t| t.id).collect();

        for info in self.scheduler.list_tasks().await {
            if !keep.contains(&info.task_id) {
                self.scheduler.remove_task(info.task_id).await;
            }
        }
        let mut reloaded = 0usize;
        for definition in active {
            let task_id = definition.id;
            match self.scheduler.register_task(definition).await {
                Ok(_) => reloaded += 1,
                Err(e) => {
                    tracing::error!(task_id, error = %e, "Failed to reschedule task during reload")
                }
            }
        }
        tracing::info!(reloaded, "Task definitions reloaded");
        Ok(reloaded)
    }

    /// Whether the task currently holds a registry entry.
    pub async fn is_task_active(&self, task_id: i64) -> bool {
        self.scheduler.is_scheduled(task_id).await
    }

    /// Number of tasks currently on the schedule.
    pub async fn active_task_count(&self) -> usize {
        self.scheduler.job_count().await
    }

    async fn fetch(&self, task_id: i64) -> Result<TaskDefinition, SchedulerError> {
        self.task_store
            .find_by_id(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound(task_id))
    }
}

fn next_fire(definition: &TaskDefinition) -> Result<DateTime<Utc>, SchedulerError> {
    let tz = trigger::parse_timezone(&definition.timezone)?;
    Ok(trigger::next_fire_time(
        &definition.cron_expression,
        tz,
        Utc::now(),
    )?)
}
