// Scheduler binary entry point

use common::config::Settings;
use common::events;
use common::monitor::ExecutionMonitor;
use common::scheduler::SchedulerManager;
use common::store::{DbPool, PgExecutionStore, PgTaskStore};
use common::telemetry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = Settings::load()?;
    settings.validate().map_err(anyhow::Error::msg)?;

    telemetry::init_logging(&settings.observability.log_level)?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!("Starting cron scheduler");

    let db_pool = DbPool::new(&settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        e
    })?;
    info!("Database connection pool initialized");

    let task_store = Arc::new(PgTaskStore::new(db_pool.clone()));
    let execution_store = Arc::new(PgExecutionStore::new(db_pool.clone()));

    let (events_tx, events_rx) = events::channel();
    let monitor = Arc::new(ExecutionMonitor::new(execution_store));
    if let Err(e) = monitor.rebuild().await {
        error!(error = %e, "Failed to rebuild execution statistics, starting from empty counters");
    }

    let monitor_cancel = CancellationToken::new();
    let monitor_task = tokio::spawn({
        let monitor = monitor.clone();
        let cancel = monitor_cancel.clone();
        async move {
            monitor.run(events_rx, cancel).await;
        }
    });

    let manager = Arc::new(SchedulerManager::new(
        settings.scheduler.clone(),
        settings.executor.clone(),
        task_store,
        events_tx,
        monitor,
    ));

    let scheduled = manager.start().await.map_err(|e| {
        error!(error = %e, "Failed to start scheduler");
        e
    })?;
    info!(scheduled, "Scheduler running");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    if let Err(e) = manager.stop().await {
        error!(error = %e, "Error during scheduler shutdown");
    }
    monitor_cancel.cancel();
    let _ = monitor_task.await;

    db_pool.close().await;
    info!("Scheduler stopped");
    Ok(())
}
