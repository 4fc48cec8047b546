//! In-memory scheduler state.
//!
//! Holds every non-terminal run keyed by run id, together with the resource
//! registry. A run's queue membership (pending, ready/waiting, running) is
//! its `JobStatus`, so a run id is always in exactly one of them.
//!
//! It also remembers, per resource, the latest run that failed while holding
//! it, so the resolver can hold back other runs on that resource for a while.

use chrono::{DateTime, Utc};
use relay_core::RunId;
use relay_core::job::{JobContext, JobStatus, WaitReason};
use std::collections::HashMap;
use std::time::Duration;

use crate::resources::{ResourceManager, ResourceUsage};

/// Single source of truth for scheduling decisions.
///
/// Owned by the scheduler behind a mutex; selection passes take it
/// exclusively.
#[derive(Debug, Default)]
pub struct SchedulerState {
    jobs: HashMap<RunId, JobContext>,
    resources: ResourceManager,
    failures: HashMap<String, ResourceFailure>,
}

/// Latest failure of a run holding a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceFailure {
    pub run_id: RunId,
    pub at: DateTime<Utc>,
}

impl SchedulerState {
    pub fn new(resources: ResourceManager) -> Self {
        Self {
            jobs: HashMap::new(),
            resources,
            failures: HashMap::new(),
        }
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn resource_usage(&self) -> Vec<ResourceUsage> {
        self.resources.usage()
    }

    /// Track a new run.
    pub fn insert(&mut self, job: JobContext) {
        self.jobs.insert(job.run_id, job);
    }

    pub fn get(&self, run_id: RunId) -> Option<&JobContext> {
        self.jobs.get(&run_id)
    }

    pub fn get_mut(&mut self, run_id: RunId) -> Option<&mut JobContext> {
        self.jobs.get_mut(&run_id)
    }

    /// Drop a run that reached a terminal state.
    pub fn remove(&mut self, run_id: RunId) -> Option<JobContext> {
        self.jobs.remove(&run_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobContext> {
        self.jobs.values()
    }

    pub fn running(&self) -> impl Iterator<Item = &JobContext> {
        self.jobs.values().filter(|j| j.status.is_running())
    }

    /// Ready and waiting runs, in no particular order.
    pub fn dispatchable(&self) -> impl Iterator<Item = &JobContext> {
        self.jobs.values().filter(|j| j.status.is_dispatchable())
    }

    /// Move pending runs whose trigger time has come to `Ready`.
    pub fn promote_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut promoted = 0;
        for job in self.jobs.values_mut() {
            if let JobStatus::Pending { trigger_at } = job.status {
                if trigger_at <= now {
                    job.status = JobStatus::Ready;
                    promoted += 1;
                }
            }
        }
        promoted
    }

    /// Earliest trigger time among pending runs.
    pub fn next_trigger_at(&self) -> Option<DateTime<Utc>> {
        self.jobs
            .values()
            .filter_map(|j| match j.status {
                JobStatus::Pending { trigger_at } => Some(trigger_at),
                _ => None,
            })
            .min()
    }

    pub fn mark_running(&mut self, run_id: RunId, started_at: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(&run_id) {
            job.status = JobStatus::Running { started_at };
            job.skipped_cycles = 0;
        }
    }

    /// Record a denied dispatch attempt.
    pub fn mark_waiting(&mut self, run_id: RunId, reason: WaitReason) {
        if let Some(job) = self.jobs.get_mut(&run_id) {
            job.status = JobStatus::Waiting { reason };
            job.skipped_cycles = job.skipped_cycles.saturating_add(1);
        }
    }

    /// Send a run back to pending for its next attempt.
    pub fn schedule_retry(&mut self, run_id: RunId, trigger_at: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(&run_id) {
            job.status = JobStatus::Pending { trigger_at };
            job.attempt += 1;
            job.skipped_cycles = 0;
        }
    }

    /// Remember that `job` failed at `at` while holding its resources.
    pub fn record_failure(&mut self, job: &JobContext, at: DateTime<Utc>) {
        for resource in job.resources().names() {
            let failure = ResourceFailure {
                run_id: job.run_id,
                at,
            };
            self.failures.insert(resource.to_string(), failure);
        }
    }

    pub fn last_failure(&self, resource: &str) -> Option<ResourceFailure> {
        self.failures.get(resource).copied()
    }

    /// A resource of `job` on which a different run failed less than
    /// `cooloff` before `now`.
    pub fn cooling_off<'a>(
        &self,
        job: &'a JobContext,
        now: DateTime<Utc>,
        cooloff: Duration,
    ) -> Option<&'a str> {
        if cooloff.is_zero() {
            return None;
        }
        job.resources().names().find(|resource| {
            self.failures.get(*resource).is_some_and(|failure| {
                failure.run_id != job.run_id
                    && (now - failure.at)
                        .to_std()
                        .map_or(true, |elapsed| elapsed < cooloff)
            })
        })
    }

    /// Snapshot of all active runs, oldest submission first.
    pub fn snapshot(&self) -> Vec<JobContext> {
        let mut jobs: Vec<JobContext> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then(a.run_id.cmp(&b.run_id))
        });
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use relay_core::job::TriggerKind;
    use relay_core::pipeline::PipelineConfig;

    fn job(name: &str) -> JobContext {
        JobContext::new(&PipelineConfig::new(name, 1), None, TriggerKind::Manual, Utc::now())
    }

    #[test]
    fn test_promote_due() {
        let now = Utc::now();
        let mut state = SchedulerState::default();
        let due = job("due").deferred_until(now - Duration::seconds(1));
        let later = job("later").deferred_until(now + Duration::seconds(60));
        let (due_id, later_id) = (due.run_id, later.run_id);
        state.insert(due);
        state.insert(later);

        assert_eq!(state.promote_due(now), 1);
        assert_eq!(state.get(due_id).unwrap().status, JobStatus::Ready);
        assert!(matches!(
            state.get(later_id).unwrap().status,
            JobStatus::Pending { .. }
        ));
        assert_eq!(state.next_trigger_at(), Some(now + Duration::seconds(60)));
    }

    #[test]
    fn test_each_run_in_one_queue() {
        let mut state = SchedulerState::default();
        let a = job("a");
        let id = a.run_id;
        state.insert(a);

        state.mark_waiting(
            id,
            WaitReason::Resource {
                resource: "db".into(),
            },
        );
        assert_eq!(state.dispatchable().count(), 1);
        assert_eq!(state.running().count(), 0);
        assert_eq!(state.get(id).unwrap().skipped_cycles, 1);

        state.mark_running(id, Utc::now());
        assert_eq!(state.dispatchable().count(), 0);
        assert_eq!(state.running().count(), 1);
        assert_eq!(state.get(id).unwrap().skipped_cycles, 0);
    }

    #[test]
    fn test_schedule_retry_bumps_attempt() {
        let mut state = SchedulerState::default();
        let a = job("a");
        let id = a.run_id;
        state.insert(a);
        state.mark_running(id, Utc::now());

        let at = Utc::now() + Duration::seconds(2);
        state.schedule_retry(id, at);
        let job = state.get(id).unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.status, JobStatus::Pending { trigger_at: at });
    }

    #[test]
    fn test_remove() {
        let mut state = SchedulerState::default();
        let a = job("a");
        let id = a.run_id;
        state.insert(a);
        assert!(state.remove(id).is_some());
        assert!(state.is_empty());
        assert!(state.remove(id).is_none());
    }

    #[test]
    fn test_failure_cools_off_shared_resources() {
        let mut state = SchedulerState::default();
        let now = Utc::now();
        let cooloff = std::time::Duration::from_secs(10);
        let failed = JobContext::new(
            &PipelineConfig::new("flaky", 1).with_resource("db", 1),
            None,
            TriggerKind::Manual,
            now,
        );
        let same_db = JobContext::new(
            &PipelineConfig::new("loader", 1).with_resource("db", 1),
            None,
            TriggerKind::Manual,
            now,
        );
        let other = JobContext::new(
            &PipelineConfig::new("mailer", 1).with_resource("smtp", 1),
            None,
            TriggerKind::Manual,
            now,
        );

        state.record_failure(&failed, now);
        assert_eq!(state.last_failure("db").map(|f| f.run_id), Some(failed.run_id));
        assert_eq!(state.cooling_off(&same_db, now + Duration::seconds(5), cooloff), Some("db"));
        assert_eq!(state.cooling_off(&other, now, cooloff), None);
        // The failed run's own retry is paced by its backoff instead.
        assert_eq!(state.cooling_off(&failed, now, cooloff), None);
        assert_eq!(state.cooling_off(&same_db, now + Duration::seconds(10), cooloff), None);
        assert_eq!(state.cooling_off(&same_db, now, std::time::Duration::ZERO), None);
    }
}
