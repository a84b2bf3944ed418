// Scheduler manager: owns the job registry, per-task timers, and dispatch

use crate::config::{ExecutorConfig, SchedulerConfig};
use crate::errors::{ScheduleError, SchedulerError};
use crate::events::{EventSender, ExecutionEvent};
use crate::executor::{ExecutionRequest, TaskExecutor};
use crate::models::{
    ExecutionStatus, NewTask, SchedulerStats, TaskDefinition, TaskInfo, TaskStatus, TaskUpdate,
    TriggerType,
};
use crate::monitor::ExecutionMonitor;
use crate::store::TaskStore;
use crate::trigger;
use chrono::{DateTime, Utc};
use metrics::gauge;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

/// One live registry entry. The timer handle drives the task's cron
/// schedule; paused entries have no timer.
struct JobEntry {
    job_id: String,
    definition: TaskDefinition,
    paused: bool,
    next_run_time: Option<DateTime<Utc>>,
    instances: Arc<Semaphore>,
    timer: Option<JoinHandle<()>>,
}

/// Shared handles cloned into timer and execution tasks.
#[derive(Clone)]
struct SchedulerContext {
    scheduler: SchedulerConfig,
    executor: Arc<TaskExecutor>,
    executor_config: ExecutorConfig,
    task_store: Arc<dyn TaskStore + Send + Sync>,
    events: EventSender,
    workers: Arc<Semaphore>,
    registry: Arc<RwLock<HashMap<i64, JobEntry>>>,
    in_flight: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

/// The scheduler. One instance owns everything: the registry of scheduled
/// jobs, one timer task per job, the worker pool gating concurrent
/// executions, and the lifecycle event channel feeding the monitor.
///
/// `start` loads active task definitions from the store and schedules them;
/// `stop` cancels timers, gives in-flight executions a grace window, and
/// force-cancels stragglers.
pub struct SchedulerManager {
    ctx: SchedulerContext,
    monitor: Arc<ExecutionMonitor>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl SchedulerManager {
    pub fn new(
        scheduler: SchedulerConfig,
        executor_config: ExecutorConfig,
        task_store: Arc<dyn TaskStore + Send + Sync>,
        events: EventSender,
        monitor: Arc<ExecutionMonitor>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(scheduler.max_workers));
        Self {
            ctx: SchedulerContext {
                scheduler,
                executor: Arc::new(TaskExecutor::new(executor_config.clone())),
                executor_config,
                task_store,
                events,
                workers,
                registry: Arc::new(RwLock::new(HashMap::new())),
                in_flight: Arc::new(Mutex::new(HashMap::new())),
            },
            monitor,
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Start the scheduler: recover tasks left in `running` status by a
    /// previous process, load active definitions, and schedule each one.
    /// Returns the number of scheduled jobs.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Scheduler start requested while already running");
            return Ok(self.ctx.registry.read().await.len());
        }

        {
            let mut guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            *guard = CancellationToken::new();
        }

        let recovered = self.ctx.task_store.reset_running().await?;
        let tasks = self.ctx.task_store.load_active().await?;
        let mut scheduled = 0usize;
        for task in tasks {
            if let Err(e) = validate_schedule(&task.cron_expression, &task.timezone) {
                tracing::error!(
                    task_id = task.id,
                    task_name = %task.name,
                    error = %e,
                    "Skipping task with invalid schedule"
                );
                let _ = self.ctx.task_store.set_status(task.id, TaskStatus::Error).await;
                continue;
            }
            self.schedule(task).await;
            scheduled += 1;
        }

        tracing::info!(scheduled, recovered, "Scheduler started");
        Ok(scheduled)
    }

    /// Stop the scheduler. In-flight executions get
    /// `shutdown_grace_seconds` to unwind after their cancellation tokens
    /// fire; anything still alive after that is aborted.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Stopping scheduler");
        self.shutdown_token().cancel();

        {
            let mut registry = self.ctx.registry.write().await;
            for (_, entry) in registry.drain() {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
        }
        gauge!("cron_registered_tasks").set(0.0);

        let grace = Duration::from_secs(self.ctx.scheduler.shutdown_grace_seconds);
        let deadline = tokio::time::Instant::now() + grace;
        let handles: Vec<(Uuid, JoinHandle<()>)> = {
            let mut in_flight = self.ctx.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.drain().collect()
        };
        for (execution_id, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                tracing::warn!(%execution_id, "Force-cancelling execution that outlived the shutdown grace");
                handle.abort();
            }
        }

        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Validate, persist, and (when active) schedule a new task.
    #[instrument(skip(self, new_task), fields(task_name = %new_task.name))]
    pub async fn add_task(&self, new_task: NewTask) -> Result<TaskDefinition, SchedulerError> {
        validate_schedule(&new_task.cron_expression, &new_task.timezone)?;
        let task = self.ctx.task_store.create(&new_task).await?;
        if task.is_active && self.is_running() {
            self.schedule(task.clone()).await;
        }
        Ok(task)
    }

    /// Apply a partial update. A changed schedule is validated against the
    /// effective expression and timezone before anything is written. The
    /// job is rescheduled from scratch, never duplicated.
    #[instrument(skip(self, update))]
    pub async fn update_task(
        &self,
        task_id: i64,
        update: TaskUpdate,
    ) -> Result<TaskDefinition, SchedulerError> {
        if update.cron_expression.is_some() || update.timezone.is_some() {
            let current = self
                .ctx
                .task_store
                .find_by_id(task_id)
                .await?
                .ok_or(SchedulerError::TaskNotFound(task_id))?;
            let expression = update
                .cron_expression
                .as_deref()
                .unwrap_or(&current.cron_expression);
            let timezone = update.timezone.as_deref().unwrap_or(&current.timezone);
            validate_schedule(expression, timezone)?;
        }

        let updated = self.ctx.task_store.update(task_id, &update).await?;
        if updated.is_active && self.is_running() {
            self.schedule(updated.clone()).await;
        } else {
            self.unschedule(task_id).await;
            let _ = self.ctx.task_store.update_next_run(task_id, None).await;
        }
        Ok(updated)
    }

    /// Take a task off the schedule without touching its definition.
    /// Returns false when the task was not scheduled.
    #[instrument(skip(self))]
    pub async fn remove_task(&self, task_id: i64) -> bool {
        if !self.unschedule(task_id).await {
            return false;
        }
        let _ = self.ctx.task_store.update_next_run(task_id, None).await;
        tracing::info!(task_id, "Task removed from schedule");
        true
    }

    /// Unschedule and soft-delete a task. The definition and its execution
    /// history stay in the store under a tombstone. Returns false for
    /// unknown or already-deleted ids.
    #[instrument(skip(self))]
    pub async fn delete_task(&self, task_id: i64) -> Result<bool, SchedulerError> {
        self.unschedule(task_id).await;
        if !self.ctx.task_store.soft_delete(task_id).await? {
            return Ok(false);
        }
        tracing::info!(task_id, "Task deleted");
        Ok(true)
    }

    /// Pause firing for a task. The registry entry survives so the task
    /// shows up in listings; its timer is stopped. Returns false when the
    /// task is not scheduled.
    #[instrument(skip(self))]
    pub async fn pause_task(&self, task_id: i64) -> bool {
        let mut registry = self.ctx.registry.write().await;
        let entry = match registry.get_mut(&task_id) {
            Some(entry) => entry,
            None => return false,
        };
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.paused = true;
        entry.next_run_time = None;
        drop(registry);
        let _ = self.ctx.task_store.update_next_run(task_id, None).await;
        tracing::info!(task_id, "Task paused");
        true
    }

    /// Resume a paused task. The next fire time is recomputed from now;
    /// firings skipped while paused are not replayed.
    #[instrument(skip(self))]
    pub async fn resume_task(&self, task_id: i64) -> bool {
        let cancel = self.shutdown_token();
        let mut registry = self.ctx.registry.write().await;
        let entry = match registry.get_mut(&task_id) {
            Some(entry) => entry,
            None => return false,
        };
        entry.paused = false;
        if entry.timer.is_none() {
            entry.timer = Some(tokio::spawn(run_timer(self.ctx.clone(), cancel, task_id)));
        }
        tracing::info!(task_id, "Task resumed");
        true
    }

    /// Trigger one immediate execution outside the cron schedule, optionally
    /// overriding the stored parameters. Returns as soon as the work is
    /// accepted; the run waits in the background for a per-task instance
    /// slot and a worker permit instead of being dropped as missed, and the
    /// result is observed through the monitor by execution id.
    #[instrument(skip(self, override_params))]
    pub async fn run_now(
        &self,
        task_id: i64,
        override_params: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<Uuid, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }
        let (mut definition, instances) = {
            let registry = self.ctx.registry.read().await;
            match registry.get(&task_id) {
                Some(entry) => (entry.definition.clone(), entry.instances.clone()),
                None => {
                    let definition = self
                        .ctx
                        .task_store
                        .find_by_id(task_id)
                        .await?
                        .ok_or(SchedulerError::TaskNotFound(task_id))?;
                    let instances = Arc::new(Semaphore::new(
                        self.ctx.scheduler.max_instances_per_task,
                    ));
                    (definition, instances)
                }
            }
        };
        if let Some(params) = override_params {
            definition.parameters = Some(params);
        }

        let execution_id = Uuid::new_v4();
        let ctx = self.ctx.clone();
        let cancel = self.shutdown_token();
        let handle = tokio::spawn(async move {
            let instance_permit = tokio::select! {
                _ = cancel.cancelled() => return,
                acquired = instances.acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let worker_permit = tokio::select! {
                _ = cancel.cancelled() => return,
                acquired = ctx.workers.clone().acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            run_execution(
                ctx,
                cancel,
                definition,
                TriggerType::Manual,
                execution_id,
                instance_permit,
                worker_permit,
            )
            .await;
        });
        let mut map = self.ctx.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, h| !h.is_finished());
        map.insert(execution_id, handle);

        tracing::info!(task_id, %execution_id, "Manual execution triggered");
        Ok(execution_id)
    }

    /// Put an already-persisted definition on the schedule, replacing any
    /// previous registration. Returns the new job id.
    pub async fn register_task(
        &self,
        definition: TaskDefinition,
    ) -> Result<String, SchedulerError> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }
        validate_schedule(&definition.cron_expression, &definition.timezone)?;
        Ok(self.schedule(definition).await)
    }

    /// Whether a task currently has a registry entry (paused or not).
    pub async fn is_scheduled(&self, task_id: i64) -> bool {
        self.ctx.registry.read().await.contains_key(&task_id)
    }

    pub async fn job_count(&self) -> usize {
        self.ctx.registry.read().await.len()
    }

    /// Snapshot of one registry entry.
    pub async fn get_task_info(&self, task_id: i64) -> Option<TaskInfo> {
        self.ctx.registry.read().await.get(&task_id).map(entry_info)
    }

    /// Snapshots of every registry entry, ordered by task id.
    pub async fn list_tasks(&self) -> Vec<TaskInfo> {
        let registry = self.ctx.registry.read().await;
        let mut infos: Vec<TaskInfo> = registry.values().map(entry_info).collect();
        infos.sort_by_key(|info| info.task_id);
        infos
    }

    /// Scheduler status plus the monitor's per-task statistics.
    pub async fn get_stats(&self) -> SchedulerStats {
        let is_running = self.is_running();
        SchedulerStats {
            is_running,
            total_tasks: self.ctx.registry.read().await.len(),
            scheduler_state: if is_running { "running" } else { "stopped" }.to_string(),
            tasks: self.monitor.get_all_stats().await,
        }
    }

    async fn schedule(&self, definition: TaskDefinition) -> String {
        let task_id = definition.id;
        let cancel = self.shutdown_token();
        let mut registry = self.ctx.registry.write().await;
        if let Some(old) = registry.remove(&task_id) {
            if let Some(timer) = old.timer {
                timer.abort();
            }
            tracing::debug!(task_id, job_id = %old.job_id, "Replacing existing schedule entry");
        }
        let job_id = make_job_id(task_id);
        tracing::info!(task_id, %job_id, cron = %definition.cron_expression, "Task scheduled");
        // Seed the next fire time so registry snapshots taken before the
        // timer's first pass already carry it.
        let next_run_time = parse_next(&definition).ok();
        registry.insert(
            task_id,
            JobEntry {
                job_id: job_id.clone(),
                definition,
                paused: false,
                next_run_time,
                instances: Arc::new(Semaphore::new(self.ctx.scheduler.max_instances_per_task)),
                timer: None,
            },
        );
        let timer = tokio::spawn(run_timer(self.ctx.clone(), cancel, task_id));
        if let Some(entry) = registry.get_mut(&task_id) {
            entry.timer = Some(timer);
        }
        gauge!("cron_registered_tasks").set(registry.len() as f64);
        job_id
    }

    async fn unschedule(&self, task_id: i64) -> bool {
        let mut registry = self.ctx.registry.write().await;
        let removed = match registry.remove(&task_id) {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        };
        gauge!("cron_registered_tasks").set(registry.len() as f64);
        removed
    }
}

fn entry_info(entry: &JobEntry) -> TaskInfo {
    TaskInfo {
        task_id: entry.definition.id,
        job_id: entry.job_id.clone(),
        name: entry.definition.name.clone(),
        next_run_time: entry.next_run_time,
        trigger_description: trigger::describe(&entry.definition.cron_expression),
        paused: entry.paused,
    }
}

fn make_job_id(task_id: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("cron_task_{}_{}", task_id, &suffix[..8])
}

fn validate_schedule(expression: &str, timezone: &str) -> Result<(), ScheduleError> {
    let tz = trigger::parse_timezone(timezone)?;
    trigger::next_fire_time(expression, tz, Utc::now())?;
    Ok(())
}

/// Per-job timer loop. Computes the next fire time, sleeps until then, and
/// dispatches the firing. Exits when the entry disappears, the schedule
/// stops producing fire times, or shutdown is requested.
async fn run_timer(ctx: SchedulerContext, cancel: CancellationToken, task_id: i64) {
    loop {
        let definition = {
            let registry = ctx.registry.read().await;
            match registry.get(&task_id) {
                Some(entry) if !entry.paused => entry.definition.clone(),
                _ => return,
            }
        };

        let next = match parse_next(&definition) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(task_id, error = %e, "Schedule stopped producing fire times");
                let _ = ctx.task_store.set_status(task_id, TaskStatus::Error).await;
                let _ = ctx.task_store.update_next_run(task_id, None).await;
                let mut registry = ctx.registry.write().await;
                if let Some(entry) = registry.get_mut(&task_id) {
                    entry.next_run_time = None;
                    entry.timer = None;
                }
                return;
            }
        };

        {
            let mut registry = ctx.registry.write().await;
            match registry.get_mut(&task_id) {
                Some(entry) => entry.next_run_time = Some(next),
                None => return,
            }
        }
        let _ = ctx.task_store.update_next_run(task_id, Some(next)).await;

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        dispatch(&ctx, &cancel, task_id, &definition, next).await;
    }
}

fn parse_next(definition: &TaskDefinition) -> Result<DateTime<Utc>, ScheduleError> {
    let tz = trigger::parse_timezone(&definition.timezone)?;
    trigger::next_fire_time(&definition.cron_expression, tz, Utc::now())
}

/// Dispatch one firing. Over-limit firings are dropped as missed; a firing
/// that cannot get a worker inside the misfire grace window is dropped too.
async fn dispatch(
    ctx: &SchedulerContext,
    cancel: &CancellationToken,
    task_id: i64,
    definition: &TaskDefinition,
    scheduled_for: DateTime<Utc>,
) {
    let instances = {
        let registry = ctx.registry.read().await;
        match registry.get(&task_id) {
            Some(entry) => entry.instances.clone(),
            None => return,
        }
    };

    let instance_permit = match instances.try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            tracing::warn!(
                task_id,
                max_instances = ctx.scheduler.max_instances_per_task,
                "Firing dropped, task already at its concurrency limit"
            );
            let _ = ctx
                .events
                .send(ExecutionEvent::Missed { task_id, scheduled_for })
                .await;
            return;
        }
    };

    let grace = Duration::from_secs(ctx.scheduler.misfire_grace_seconds);
    let worker_permit = tokio::select! {
        _ = cancel.cancelled() => return,
        acquired = tokio::time::timeout(grace, ctx.workers.clone().acquire_owned()) => {
            match acquired {
                Ok(Ok(permit)) => permit,
                _ => {
                    tracing::warn!(
                        task_id,
                        grace_seconds = ctx.scheduler.misfire_grace_seconds,
                        "Firing dropped, no worker became free inside the misfire grace window"
                    );
                    drop(instance_permit);
                    let _ = ctx
                        .events
                        .send(ExecutionEvent::Missed { task_id, scheduled_for })
                        .await;
                    return;
                }
            }
        }
    };

    spawn_execution(
        ctx.clone(),
        cancel.clone(),
        definition.clone(),
        TriggerType::Scheduled,
        instance_permit,
        worker_permit,
    );
}

/// Spawn the execution task for one firing. Permits ride along and release
/// when the task finishes. The task id and terminal status are reconciled
/// back into the store around the run.
fn spawn_execution(
    ctx: SchedulerContext,
    cancel: CancellationToken,
    definition: TaskDefinition,
    trigger_type: TriggerType,
    instance_permit: OwnedSemaphorePermit,
    worker_permit: OwnedSemaphorePermit,
) -> Uuid {
    let execution_id = Uuid::new_v4();
    let in_flight = ctx.in_flight.clone();
    let handle = tokio::spawn(run_execution(
        ctx,
        cancel,
        definition,
        trigger_type,
        execution_id,
        instance_permit,
        worker_permit,
    ));

    let mut map = in_flight.lock().unwrap_or_else(|e| e.into_inner());
    map.retain(|_, h| !h.is_finished());
    map.insert(execution_id, handle);
    execution_id
}

/// One execution from Started event to store reconciliation. Removes its
/// own in-flight entry on the way out.
#[allow(clippy::too_many_arguments)]
async fn run_execution(
    ctx: SchedulerContext,
    cancel: CancellationToken,
    definition: TaskDefinition,
    trigger_type: TriggerType,
    execution_id: Uuid,
    instance_permit: OwnedSemaphorePermit,
    worker_permit: OwnedSemaphorePermit,
) {
    let _instance = instance_permit;
    let _worker = worker_permit;
    let task_id = definition.id;

    let _ = ctx
        .events
        .send(ExecutionEvent::Started {
            task_id,
            task_name: definition.name.clone(),
            execution_id,
            trigger_type,
        })
        .await;
    if let Err(e) = ctx.task_store.set_status(task_id, TaskStatus::Running).await {
        tracing::warn!(task_id, error = %e, "Failed to mark task running");
    }

    let request = ExecutionRequest::from_task(&definition, &ctx.executor_config);
    let result = ctx.executor.execute(&request, cancel.child_token()).await;

    let success = result.is_success();
    let finished_at = result.finished_at;
    let status_after = match result.status {
        ExecutionStatus::Success | ExecutionStatus::Cancelled => TaskStatus::Enabled,
        _ => TaskStatus::Error,
    };
    let outcome = result.into_outcome();

    let _ = ctx
        .events
        .send(ExecutionEvent::Finished {
            task_id,
            execution_id,
            outcome,
        })
        .await;
    if let Err(e) = ctx
        .task_store
        .record_result(task_id, success, finished_at)
        .await
    {
        tracing::warn!(task_id, error = %e, "Failed to record execution result");
    }
    if let Err(e) = ctx.task_store.set_status(task_id, status_after).await {
        tracing::warn!(task_id, error = %e, "Failed to reconcile task status");
    }

    ctx.in_flight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&execution_id);
}
