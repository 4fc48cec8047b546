//! Scheduler lifecycle events.

use chrono::{DateTime, Utc};
use relay_core::RunId;
use relay_core::history::HistoryStatus;
use relay_core::job::TriggerKind;
use serde::{Deserialize, Serialize};

/// Broadcast to every subscriber as runs move through the scheduler.
///
/// Delivery is best effort: a slow subscriber sees `Lagged` and misses
/// events rather than holding the scheduler back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Submitted {
        run_id: RunId,
        pipeline: String,
        trigger: TriggerKind,
    },
    Dispatched {
        run_id: RunId,
        pipeline: String,
        attempt: u32,
    },
    RetryScheduled {
        run_id: RunId,
        pipeline: String,
        /// The attempt that will run next.
        next_attempt: u32,
        trigger_at: DateTime<Utc>,
        error: String,
    },
    Finished {
        run_id: RunId,
        pipeline: String,
        status: HistoryStatus,
        error: Option<String>,
    },
}

impl SchedulerEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            SchedulerEvent::Submitted { run_id, .. }
            | SchedulerEvent::Dispatched { run_id, .. }
            | SchedulerEvent::RetryScheduled { run_id, .. }
            | SchedulerEvent::Finished { run_id, .. } => *run_id,
        }
    }

    pub fn pipeline(&self) -> &str {
        match self {
            SchedulerEvent::Submitted { pipeline, .. }
            | SchedulerEvent::Dispatched { pipeline, .. }
            | SchedulerEvent::RetryScheduled { pipeline, .. }
            | SchedulerEvent::Finished { pipeline, .. } => pipeline,
        }
    }
}
