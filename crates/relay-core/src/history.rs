//! Job history records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RunId;

/// Outcome of one recorded attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Succeeded,
    Failed,
    Cancelled,
    /// A transient failure that will be retried. Not terminal.
    RetryScheduled,
}

impl HistoryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HistoryStatus::RetryScheduled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Succeeded => "succeeded",
            HistoryStatus::Failed => "failed",
            HistoryStatus::Cancelled => "cancelled",
            HistoryStatus::RetryScheduled => "retry_scheduled",
        }
    }
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HistoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(HistoryStatus::Succeeded),
            "failed" => Ok(HistoryStatus::Failed),
            "cancelled" => Ok(HistoryStatus::Cancelled),
            "retry_scheduled" => Ok(HistoryStatus::RetryScheduled),
            other => Err(format!("unknown history status: {other}")),
        }
    }
}

/// One execution attempt of a run. Never modified once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHistoryRecord {
    pub run_id: RunId,
    pub pipeline: String,
    /// `None` when the run ended before it started executing.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub status: HistoryStatus,
    pub attempt: u32,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            HistoryStatus::Succeeded,
            HistoryStatus::Failed,
            HistoryStatus::Cancelled,
            HistoryStatus::RetryScheduled,
        ] {
            assert_eq!(status.as_str().parse::<HistoryStatus>(), Ok(status));
        }
        assert!("bogus".parse::<HistoryStatus>().is_err());
    }

    #[test]
    fn test_retry_record_is_not_terminal() {
        assert!(!HistoryStatus::RetryScheduled.is_terminal());
        assert!(HistoryStatus::Cancelled.is_terminal());
    }
}
