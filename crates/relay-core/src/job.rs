//! Job context and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::RunId;
use crate::pipeline::{PipelineConfig, ResourceRequirements, RetryPolicy};

/// The part of a pipeline definition a run needs, copied at submission time
/// so that a configuration reload never changes a run already in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub resources: ResourceRequirements,
    pub conflicts_with: BTreeSet<String>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub retry_on_timeout: bool,
    pub notify_on_success: bool,
    pub command: Option<String>,
    pub env: HashMap<String, String>,
}

impl From<&PipelineConfig> for RunSpec {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            resources: config.resources.clone(),
            conflicts_with: config.conflicts_with.clone(),
            retry: config.retry.clone(),
            timeout: config.timeout,
            retry_on_timeout: config.retry_on_timeout,
            notify_on_success: config.notify_on_success,
            command: config.command.clone(),
            env: config.env.clone(),
        }
    }
}

/// How a run came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerKind {
    Manual,
    Schedule,
}

/// Why a ready job was not dispatched in the last cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitReason {
    /// Not enough free capacity.
    Resource { resource: String },
    /// Declared conflict with a running pipeline.
    Conflict { pipeline: String },
    /// Capacity is held back for an escalated job.
    Reserved { resource: String },
    /// Another run recently failed while holding this resource.
    CoolingOff { resource: String },
}

impl std::fmt::Display for WaitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitReason::Resource { resource } => write!(f, "waiting for resource '{resource}'"),
            WaitReason::Conflict { pipeline } => {
                write!(f, "conflicts with running pipeline '{pipeline}'")
            }
            WaitReason::Reserved { resource } => {
                write!(f, "resource '{resource}' reserved for a starved job")
            }
            WaitReason::CoolingOff { resource } => {
                write!(f, "resource '{resource}' cooling off after a failure")
            }
        }
    }
}

/// Status of an active run.
///
/// `Ready` and `Waiting` are the same queue position; `Waiting` only records
/// that the last dispatch attempt was denied. `Running` is the only state in
/// which a run holds resources. A run leaves the scheduler the moment it
/// reaches a terminal state, which is recorded as a `HistoryStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Submitted, trigger time not reached yet (also used while backing off).
    Pending { trigger_at: DateTime<Utc> },
    /// Trigger time reached, awaiting dispatch.
    Ready,
    /// Dispatch was denied in the last cycle.
    Waiting { reason: WaitReason },
    /// Resources granted, executing.
    Running { started_at: DateTime<Utc> },
}

impl JobStatus {
    /// Ready or waiting: eligible for the next selection pass.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Waiting { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, JobStatus::Running { .. })
    }
}

/// One run of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub run_id: RunId,
    pub pipeline: String,
    pub submitted_at: DateTime<Utc>,
    /// Priority from the config, or the submission override.
    pub priority: i32,
    pub status: JobStatus,
    /// 1-based number of the current (or next) attempt.
    pub attempt: u32,
    /// Consecutive selection passes this run was denied.
    pub skipped_cycles: u32,
    pub trigger: TriggerKind,
    pub spec: RunSpec,
    /// Set once an operator asked to cancel a running job.
    pub cancel_requested: bool,
}

impl JobContext {
    /// Create a run of `config`, ready immediately.
    pub fn new(
        config: &PipelineConfig,
        priority_override: Option<i32>,
        trigger: TriggerKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            pipeline: config.name.clone(),
            submitted_at: now,
            priority: priority_override.unwrap_or(config.priority),
            status: JobStatus::Ready,
            attempt: 1,
            skipped_cycles: 0,
            trigger,
            spec: RunSpec::from(config),
            cancel_requested: false,
        }
    }

    /// Defer the run until `trigger_at`.
    pub fn deferred_until(mut self, trigger_at: DateTime<Utc>) -> Self {
        self.status = JobStatus::Pending { trigger_at };
        self
    }

    pub fn resources(&self) -> &ResourceRequirements {
        &self.spec.resources
    }

    /// Whether this run and a run of `other_pipeline` (declaring
    /// `other_conflicts`) must not execute together.
    pub fn conflicts_with(&self, other_pipeline: &str, other_conflicts: &BTreeSet<String>) -> bool {
        self.spec.conflicts_with.contains(other_pipeline) || other_conflicts.contains(&self.pipeline)
    }
}
