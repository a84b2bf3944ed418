// Internal lifecycle event channel between the scheduler and the monitor
//
// The scheduler side only ever sends events; the execution monitor owns the
// receiving end and is the single writer of the execution log. This keeps the
// manager decoupled from how outcomes are persisted.

use crate::models::{ExecutionOutcome, TriggerType};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Capacity of the event channel. Senders briefly backpressure when the
/// monitor falls behind rather than dropping lifecycle records.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notification emitted by the scheduler manager.
#[derive(Debug)]
pub enum ExecutionEvent {
    /// An execution is about to run its first attempt.
    Started {
        task_id: i64,
        task_name: String,
        execution_id: Uuid,
        trigger_type: TriggerType,
    },
    /// An execution reached a terminal state.
    Finished {
        task_id: i64,
        execution_id: Uuid,
        outcome: ExecutionOutcome,
    },
    /// A firing was dropped by the concurrency limit or misfire window.
    /// No execution row exists for it.
    Missed {
        task_id: i64,
        scheduled_for: DateTime<Utc>,
    },
}

pub type EventSender = mpsc::Sender<ExecutionEvent>;
pub type EventReceiver = mpsc::Receiver<ExecutionEvent>;

/// Create the event channel pair shared by the manager and the monitor.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}
