// Execution monitoring: log persistence and in-memory statistics

use crate::errors::StoreError;
use crate::events::{EventReceiver, ExecutionEvent};
use crate::models::{ExecutionLog, ExecutionStatus, LogPage, TaskStats};
use crate::store::ExecutionStore;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

/// Subscribes to the scheduler's lifecycle events, persists execution log
/// rows, and maintains rolling per-task statistics in memory.
///
/// Persistence failures are logged and swallowed so a database hiccup never
/// stalls the scheduler; the in-memory counters still advance.
pub struct ExecutionMonitor {
    store: Arc<dyn ExecutionStore + Send + Sync>,
    stats: RwLock<HashMap<i64, TaskStats>>,
}

impl ExecutionMonitor {
    pub fn new(store: Arc<dyn ExecutionStore + Send + Sync>) -> Self {
        Self {
            store,
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the in-memory statistics from persisted execution history.
    /// Called once on startup so counters survive a process restart. Missed
    /// counts are not persisted and restart at zero.
    #[instrument(skip(self))]
    pub async fn rebuild(&self) -> Result<(), StoreError> {
        let aggregates = self.store.aggregate_stats().await?;
        let mut stats = self.stats.write().await;
        stats.clear();
        for agg in &aggregates {
            let total = agg.total_executions.max(1);
            stats.insert(
                agg.task_id,
                TaskStats {
                    total_executions: agg.total_executions as u64,
                    success_count: agg.success_count as u64,
                    error_count: agg.error_count as u64,
                    missed_count: 0,
                    total_duration_ms: agg.total_duration_ms,
                    avg_duration_ms: agg.total_duration_ms / total,
                    min_duration_ms: agg.min_duration_ms,
                    max_duration_ms: agg.max_duration_ms,
                    last_execution_at: agg.last_execution_at,
                    last_status: None,
                },
            );
        }
        tracing::info!(tasks = aggregates.len(), "Rebuilt execution statistics from history");
        Ok(())
    }

    /// Consume lifecycle events until the channel closes or shutdown is
    /// requested. On shutdown, already-queued events are drained so finished
    /// executions are not lost.
    pub async fn run(&self, mut events: EventReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    while let Ok(event) = events.try_recv() {
                        self.handle(event).await;
                    }
                    break;
                }
            }
        }
        tracing::debug!("Execution monitor stopped");
    }

    async fn handle(&self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::Started {
                task_id,
                task_name,
                execution_id,
                trigger_type,
            } => {
                counter!("cron_executions_started_total").increment(1);
                let log = ExecutionLog::started(execution_id, task_id, task_name, trigger_type);
                if let Err(e) = self.store.insert(&log).await {
                    tracing::error!(task_id, %execution_id, error = %e, "Failed to persist execution start");
                }
            }
            ExecutionEvent::Finished {
                task_id,
                execution_id,
                outcome,
            } => {
                counter!(
                    "cron_executions_finished_total",
                    "status" => outcome.status.to_string()
                )
                .increment(1);
                {
                    let mut stats = self.stats.write().await;
                    stats.entry(task_id).or_default().record(
                        outcome.status,
                        outcome.duration_ms,
                        outcome.finished_at,
                    );
                }
                if let Err(e) = self.store.seal(execution_id, &outcome).await {
                    tracing::error!(task_id, %execution_id, error = %e, "Failed to persist execution outcome");
                }
            }
            ExecutionEvent::Missed {
                task_id,
                scheduled_for,
            } => {
                counter!("cron_executions_missed_total").increment(1);
                tracing::warn!(task_id, %scheduled_for, "Task firing missed");
                let mut stats = self.stats.write().await;
                stats.entry(task_id).or_default().missed_count += 1;
            }
        }
    }

    /// Rolling statistics for one task, if any execution has been seen.
    pub async fn get_stats(&self, task_id: i64) -> Option<TaskStats> {
        self.stats.read().await.get(&task_id).cloned()
    }

    /// Snapshot of statistics for every known task.
    pub async fn get_all_stats(&self) -> HashMap<i64, TaskStats> {
        self.stats.read().await.clone()
    }

    /// One execution log row by id, straight from the store.
    pub async fn get_log(&self, execution_id: Uuid) -> Result<Option<ExecutionLog>, StoreError> {
        self.store.find_by_id(execution_id).await
    }

    /// Paginated execution history for a task, newest first, optionally
    /// filtered by status.
    #[instrument(skip(self))]
    pub async fn list_logs(
        &self,
        task_id: i64,
        page: u32,
        page_size: u32,
        status: Option<ExecutionStatus>,
    ) -> Result<LogPage, StoreError> {
        self.store.list(task_id, page, page_size, status).await
    }

    /// Retention sweep over the execution history: drop every log older
    /// than the given number of days. Returns the number of rows deleted.
    /// In-memory statistics are left alone; they describe the process
    /// lifetime, not the retained history.
    #[instrument(skip(self))]
    pub async fn cleanup_old_logs(&self, retention_days: u32) -> Result<u64, StoreError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days as i64);
        let deleted = self.store.delete_older_than(cutoff).await?;
        tracing::info!(retention_days, deleted, "Cleaned up old execution logs");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionOutcome, TriggerType};
    use crate::store::StatsAggregate;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        inserted: Mutex<Vec<ExecutionLog>>,
        sealed: Mutex<Vec<(Uuid, ExecutionOutcome)>>,
        aggregates: Mutex<Vec<StatsAggregate>>,
        fail_writes: bool,
    }

    #[async_trait]
    impl ExecutionStore for RecordingStore {
        async fn insert(&self, log: &ExecutionLog) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::ConnectionFailed("down".to_string()));
            }
            self.inserted.lock().unwrap().push(log.clone());
            Ok(())
        }

        async fn seal(
            &self,
            execution_id: Uuid,
            outcome: &ExecutionOutcome,
        ) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::ConnectionFailed("down".to_string()));
            }
            self.sealed.lock().unwrap().push((execution_id, outcome.clone()));
            Ok(())
        }

        async fn find_by_id(&self, _id: Uuid) -> Result<Option<ExecutionLog>, StoreError> {
            Ok(None)
        }

        async fn list(
            &self,
            _task_id: i64,
            page: u32,
            page_size: u32,
            _status: Option<ExecutionStatus>,
        ) -> Result<LogPage, StoreError> {
            Ok(LogPage {
                logs: vec![],
                total: 0,
                page,
                page_size,
                total_pages: 0,
            })
        }

        async fn aggregate_stats(&self) -> Result<Vec<StatsAggregate>, StoreError> {
            Ok(self.aggregates.lock().unwrap().clone())
        }

        async fn delete_older_than(
            &self,
            cutoff: chrono::DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            let mut inserted = self.inserted.lock().unwrap();
            let before = inserted.len();
            inserted.retain(|l| l.started_at >= cutoff);
            Ok((before - inserted.len()) as u64)
        }
    }

    fn outcome(status: ExecutionStatus, duration_ms: i64) -> ExecutionOutcome {
        ExecutionOutcome {
            status,
            finished_at: Utc::now(),
            duration_ms,
            exit_code: Some(0),
            output: None,
            error_output: None,
            error_message: None,
            retry_count: 0,
            peak_cpu_percent: None,
            peak_memory_mb: None,
        }
    }

    #[tokio::test]
    async fn test_started_event_persists_running_row() {
        let store = Arc::new(RecordingStore::default());
        let monitor = ExecutionMonitor::new(store.clone());
        let execution_id = Uuid::new_v4();

        monitor
            .handle(ExecutionEvent::Started {
                task_id: 7,
                task_name: "nightly-backup".to_string(),
                execution_id,
                trigger_type: TriggerType::Scheduled,
            })
            .await;

        let inserted = store.inserted.lock().unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].execution_id, execution_id);
        assert_eq!(inserted[0].status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_finished_event_updates_stats_and_seals_row() {
        let store = Arc::new(RecordingStore::default());
        let monitor = ExecutionMonitor::new(store.clone());
        let execution_id = Uuid::new_v4();

        monitor
            .handle(ExecutionEvent::Finished {
                task_id: 7,
                execution_id,
                outcome: outcome(ExecutionStatus::Success, 120),
            })
            .await;
        monitor
            .handle(ExecutionEvent::Finished {
                task_id: 7,
                execution_id: Uuid::new_v4(),
                outcome: outcome(ExecutionStatus::Error, 80),
            })
            .await;

        let stats = monitor.get_stats(7).await.unwrap();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.avg_duration_ms, 100);
        assert_eq!(store.sealed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_still_updates_memory() {
        let store = Arc::new(RecordingStore {
            fail_writes: true,
            ..Default::default()
        });
        let monitor = ExecutionMonitor::new(store);

        monitor
            .handle(ExecutionEvent::Finished {
                task_id: 3,
                execution_id: Uuid::new_v4(),
                outcome: outcome(ExecutionStatus::Success, 50),
            })
            .await;

        let stats = monitor.get_stats(3).await.unwrap();
        assert_eq!(stats.total_executions, 1);
    }

    #[tokio::test]
    async fn test_missed_event_increments_counter_only() {
        let store = Arc::new(RecordingStore::default());
        let monitor = ExecutionMonitor::new(store.clone());

        monitor
            .handle(ExecutionEvent::Missed {
                task_id: 5,
                scheduled_for: Utc::now(),
            })
            .await;

        let stats = monitor.get_stats(5).await.unwrap();
        assert_eq!(stats.missed_count, 1);
        assert_eq!(stats.total_executions, 0);
        assert!(store.inserted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_restores_counters_from_history() {
        let store = Arc::new(RecordingStore::default());
        store.aggregates.lock().unwrap().push(StatsAggregate {
            task_id: 9,
            total_executions: 10,
            success_count: 8,
            error_count: 2,
            total_duration_ms: 1000,
            min_duration_ms: Some(50),
            max_duration_ms: Some(300),
            last_execution_at: Some(Utc::now()),
        });
        let monitor = ExecutionMonitor::new(store);
        monitor.rebuild().await.unwrap();

        let stats = monitor.get_stats(9).await.unwrap();
        assert_eq!(stats.total_executions, 10);
        assert_eq!(stats.success_count, 8);
        assert_eq!(stats.avg_duration_ms, 100);
        assert_eq!(stats.missed_count, 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_logs_past_retention() {
        let store = Arc::new(RecordingStore::default());
        let mut old_log = ExecutionLog::started(
            Uuid::new_v4(),
            2,
            "archival".to_string(),
            TriggerType::Scheduled,
        );
        old_log.started_at = Utc::now() - chrono::Duration::days(45);
        let fresh_log = ExecutionLog::started(
            Uuid::new_v4(),
            2,
            "archival".to_string(),
            TriggerType::Scheduled,
        );
        store.inserted.lock().unwrap().push(old_log);
        store.inserted.lock().unwrap().push(fresh_log.clone());

        let monitor = ExecutionMonitor::new(store.clone());
        let deleted = monitor.cleanup_old_logs(30).await.unwrap();

        assert_eq!(deleted, 1);
        let remaining = store.inserted.lock().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].execution_id, fresh_log.execution_id);
    }

    #[tokio::test]
    async fn test_run_drains_queued_events_on_shutdown() {
        let store = Arc::new(RecordingStore::default());
        let monitor = Arc::new(ExecutionMonitor::new(store.clone()));
        let (tx, rx) = crate::events::channel();
        let cancel = CancellationToken::new();

        tx.send(ExecutionEvent::Finished {
            task_id: 1,
            execution_id: Uuid::new_v4(),
            outcome: outcome(ExecutionStatus::Success, 10),
        })
        .await
        .unwrap();
        cancel.cancel();
        monitor.run(rx, cancel).await;

        assert_eq!(store.sealed.lock().unwrap().len(), 1);
    }
}
