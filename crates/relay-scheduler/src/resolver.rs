//! Dispatch ordering and safety checks.
//!
//! Each scheduling cycle the resolver orders the ready runs and walks them
//! once, dispatching every run that is safe to start:
//!
//! 1. Order by effective priority (descending), then submission time
//!    (ascending), then run id. No randomness is involved.
//! 2. Skip a run that conflicts with a running pipeline. Conflict pairs are
//!    symmetric and runs dispatched earlier in the same pass count as running.
//! 3. Skip a run that needs a resource another run failed on within the
//!    configured failure cool-off.
//! 4. Skip a run whose full resource set cannot be granted right now.
//!
//! A run skipped `escalation_threshold` times gains `escalation_boost`
//! effective priority, and again for every further `escalation_threshold`
//! skips. Once escalated, a run that is denied resources reserves them for
//! the rest of the pass so smaller runs cannot keep taking them first.

use chrono::{DateTime, Utc};
use relay_config::SchedulerSettings;
use relay_core::RunId;
use relay_core::job::{JobContext, WaitReason};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

use crate::resources::ResourceGrant;
use crate::state::SchedulerState;

/// A run that was granted its resources and must now be executed.
#[derive(Debug)]
pub struct Dispatch {
    /// Snapshot of the run as it entered `Running`.
    pub job: JobContext,
    pub grant: ResourceGrant,
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    escalation_threshold: u32,
    escalation_boost: i32,
    failure_cooloff: Duration,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::from_settings(&SchedulerSettings::default())
    }
}

impl ConflictResolver {
    pub fn new(escalation_threshold: u32, escalation_boost: i32) -> Self {
        Self {
            escalation_threshold: escalation_threshold.max(1),
            escalation_boost,
            failure_cooloff: Duration::ZERO,
        }
    }

    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self::new(settings.escalation_threshold, settings.escalation_boost)
            .with_failure_cooloff(settings.failure_cooloff)
    }

    /// Hold back runs on a resource for `cooloff` after a run failed on it.
    pub fn with_failure_cooloff(mut self, cooloff: Duration) -> Self {
        self.failure_cooloff = cooloff;
        self
    }

    /// Priority used for ordering, including starvation escalation.
    pub fn effective_priority(&self, job: &JobContext) -> i64 {
        let levels = i64::from(job.skipped_cycles / self.escalation_threshold);
        i64::from(job.priority) + levels * i64::from(self.escalation_boost)
    }

    pub fn is_escalated(&self, job: &JobContext) -> bool {
        job.skipped_cycles >= self.escalation_threshold
    }

    /// Dispatch order for a set of candidates.
    pub fn order<'a>(&self, jobs: impl IntoIterator<Item = &'a JobContext>) -> Vec<&'a JobContext> {
        let mut jobs: Vec<&JobContext> = jobs.into_iter().collect();
        jobs.sort_by_key(|j| (Reverse(self.effective_priority(j)), j.submitted_at, j.run_id));
        jobs
    }

    /// Run one selection pass over `state`.
    ///
    /// Dispatched runs are moved to `Running` and returned with their grants;
    /// skipped runs are moved to `Waiting` with the reason.
    pub fn select(&self, state: &mut SchedulerState, now: DateTime<Utc>) -> Vec<Dispatch> {
        let ordered: Vec<RunId> = self
            .order(state.dispatchable().filter(|j| !j.cancel_requested))
            .into_iter()
            .map(|j| j.run_id)
            .collect();

        let mut running: Vec<(String, BTreeSet<String>)> = state
            .running()
            .map(|j| (j.pipeline.clone(), j.spec.conflicts_with.clone()))
            .collect();
        let mut reserved: BTreeSet<String> = BTreeSet::new();
        let mut dispatched = Vec::new();

        for run_id in ordered {
            let Some(job) = state.get(run_id).cloned() else {
                continue;
            };

            if let Some((pipeline, _)) = running
                .iter()
                .find(|(pipeline, conflicts)| job.conflicts_with(pipeline, conflicts))
            {
                debug!(run_id = %run_id, pipeline = %job.pipeline, blocker = %pipeline, "conflict, deferring");
                let reason = WaitReason::Conflict {
                    pipeline: pipeline.clone(),
                };
                state.mark_waiting(run_id, reason);
                continue;
            }

            if let Some(resource) = state
                .cooling_off(&job, now, self.failure_cooloff)
                .map(String::from)
            {
                debug!(run_id = %run_id, pipeline = %job.pipeline, %resource, "resource cooling off, deferring");
                state.mark_waiting(run_id, WaitReason::CoolingOff { resource });
                continue;
            }

            if let Some(resource) = job.resources().names().find(|r| reserved.contains(*r)) {
                let reason = WaitReason::Reserved {
                    resource: resource.to_string(),
                };
                state.mark_waiting(run_id, reason);
                continue;
            }

            match state.resources().try_acquire_all(run_id, job.resources()) {
                Ok(grant) => {
                    running.push((job.pipeline.clone(), job.spec.conflicts_with.clone()));
                    state.mark_running(run_id, now);
                    let job = state.get(run_id).cloned().unwrap_or(job);
                    info!(
                        run_id = %run_id,
                        pipeline = %job.pipeline,
                        priority = job.priority,
                        attempt = job.attempt,
                        "dispatching"
                    );
                    dispatched.push(Dispatch { job, grant });
                }
                Err(denied) => {
                    debug!(run_id = %run_id, pipeline = %job.pipeline, %denied, "resources unavailable, deferring");
                    if self.is_escalated(&job) {
                        reserved.extend(job.resources().names().map(String::from));
                    }
                    let reason = WaitReason::Resource {
                        resource: denied.resource().to_string(),
                    };
                    state.mark_waiting(run_id, reason);
                }
            }
        }

        dispatched
    }
}
