// Error handling framework

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("No upcoming fire time for expression '{expression}' within the search horizon")]
    NoUpcomingFire { expression: String },
}

/// Task execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Command is empty")]
    EmptyCommand,

    #[error("Command contains shell metacharacter '{character}': {command}")]
    UnsafeCommand { command: String, character: char },

    #[error("Failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("Execution timeout after {0} seconds")]
    Timeout(u64),

    #[error("Execution cancelled")]
    Cancelled,
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Record not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::ConnectionFailed(err.to_string())
            }
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => StoreError::DuplicateKey(db_err.message().to_string()),
                        "23503" => StoreError::ForeignKeyViolation(db_err.message().to_string()),
                        _ => StoreError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    StoreError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

/// Scheduler manager errors surfaced to the control plane
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Persistence error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "expected 5 or 6 fields".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout(300);
        assert!(err.to_string().contains("300 seconds"));
    }

    #[test]
    fn test_scheduler_error_wraps_schedule_error() {
        let err: SchedulerError = ScheduleError::InvalidTimezone("Mars/Olympus".to_string()).into();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
    }

    #[test]
    fn test_store_error_from_row_not_found() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
