//! Pipeline execution.
//!
//! The executor takes a dispatched run (resources already granted), runs one
//! attempt through the pipeline's runner and settles the result: resources
//! are released, history is written, the run is re-queued or retired, and
//! alerts and events go out.

use chrono::{DateTime, Utc};
use relay_core::RunId;
use relay_core::history::{HistoryStatus, JobHistoryRecord};
use relay_core::job::{JobContext, JobStatus};
use relay_core::runner::{PipelineOutcome, PipelineRunner};
use relay_db::HistoryStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify, broadcast};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::alerts::{AlertManager, alert_for};
use crate::events::SchedulerEvent;
use crate::resolver::Dispatch;
use crate::retry::{AttemptOutcome, Decision, decide, jittered};
use crate::state::SchedulerState;

/// Maps pipelines to the runner that executes them.
#[derive(Clone, Default)]
pub struct RunnerSet {
    fallback: Option<Arc<dyn PipelineRunner>>,
    by_pipeline: HashMap<String, Arc<dyn PipelineRunner>>,
}

impl std::fmt::Debug for RunnerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerSet")
            .field("fallback", &self.fallback.as_ref().map(|r| r.name()))
            .field("pipelines", &self.by_pipeline.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RunnerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner for pipelines without a dedicated one.
    pub fn with_fallback(mut self, runner: Arc<dyn PipelineRunner>) -> Self {
        self.fallback = Some(runner);
        self
    }

    pub fn with_pipeline(mut self, pipeline: impl Into<String>, runner: Arc<dyn PipelineRunner>) -> Self {
        self.by_pipeline.insert(pipeline.into(), runner);
        self
    }

    pub fn get(&self, pipeline: &str) -> Option<Arc<dyn PipelineRunner>> {
        self.by_pipeline
            .get(pipeline)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Shared handles the executor settles runs into.
pub(crate) struct ExecutorContext {
    pub state: Arc<AsyncMutex<SchedulerState>>,
    pub history: Arc<dyn HistoryStore>,
    pub alerts: AlertManager,
    pub events: broadcast::Sender<SchedulerEvent>,
    pub wake: Arc<Notify>,
    pub history_timeout: Duration,
}

pub struct PipelineExecutor {
    runners: RunnerSet,
    cancel_grace: Duration,
    ctx: ExecutorContext,
    tokens: Mutex<HashMap<RunId, CancellationToken>>,
}

impl PipelineExecutor {
    pub(crate) fn new(runners: RunnerSet, cancel_grace: Duration, ctx: ExecutorContext) -> Self {
        Self {
            runners,
            cancel_grace,
            ctx,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<RunId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start executing a dispatched run in the background.
    ///
    /// Called with the state lock held, so the run's cancellation token is
    /// registered before anyone can observe it as running.
    pub(crate) fn launch(self: &Arc<Self>, dispatch: Dispatch) {
        let run_id = dispatch.job.run_id;
        let token = CancellationToken::new();
        self.tokens().insert(run_id, token.clone());

        let _ = self.ctx.events.send(SchedulerEvent::Dispatched {
            run_id,
            pipeline: dispatch.job.pipeline.clone(),
            attempt: dispatch.job.attempt,
        });

        let span = info_span!(
            "run",
            run_id = %run_id,
            pipeline = %dispatch.job.pipeline,
            attempt = dispatch.job.attempt
        );
        let executor = Arc::clone(self);
        tokio::spawn(async move { executor.execute(dispatch, token).await }.instrument(span));
    }

    /// Signal cooperative cancellation to a running attempt.
    pub(crate) fn cancel(&self, run_id: RunId) -> bool {
        match self.tokens().get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of attempts currently executing.
    pub fn in_flight(&self) -> usize {
        self.tokens().len()
    }

    async fn execute(&self, dispatch: Dispatch, cancel: CancellationToken) {
        let Dispatch { job, mut grant } = dispatch;
        let started_at = match job.status {
            JobStatus::Running { started_at } => started_at,
            _ => Utc::now(),
        };

        let outcome = if cancel.is_cancelled() {
            AttemptOutcome::Cancelled
        } else {
            self.attempt(&job, &cancel).await
        };

        grant.release();
        self.tokens().remove(&job.run_id);
        self.settle(job, started_at, outcome).await;
    }

    /// Run one attempt, enforcing the timeout and the cancel grace period.
    async fn attempt(&self, job: &JobContext, cancel: &CancellationToken) -> AttemptOutcome {
        let Some(runner) = self.runners.get(&job.pipeline) else {
            return AttemptOutcome::Fatal(format!("no runner for pipeline '{}'", job.pipeline));
        };

        debug!(runner = runner.name(), "starting attempt");
        let attempt_token = cancel.child_token();
        let mut handle = {
            let job = job.clone();
            let token = attempt_token.clone();
            tokio::spawn(async move { runner.run(&job, token).await })
        };

        let timeout = job.spec.timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        let timed_out = tokio::select! {
            joined = &mut handle => {
                if cancel.is_cancelled() {
                    return AttemptOutcome::Cancelled;
                }
                return outcome_of(joined);
            }
            _ = cancel.cancelled() => false,
            _ = deadline => {
                attempt_token.cancel();
                true
            }
        };

        if tokio::time::timeout(self.cancel_grace, &mut handle).await.is_err() {
            warn!(grace = ?self.cancel_grace, "pipeline ignored cancellation, aborting");
            handle.abort();
        }

        match timeout {
            Some(limit) if timed_out && !cancel.is_cancelled() => AttemptOutcome::TimedOut(limit),
            _ => AttemptOutcome::Cancelled,
        }
    }

    /// Apply the outcome of an attempt. Resources are already released.
    async fn settle(&self, job: JobContext, started_at: DateTime<Utc>, outcome: AttemptOutcome) {
        let run_id = job.run_id;
        let finished_at = Utc::now();
        let mut decision = decide(&job.spec, job.attempt, &outcome);

        let mut state = self.ctx.state.lock().await;

        // A cancel request wins over whatever the attempt reported.
        if state.get(run_id).is_some_and(|j| j.cancel_requested) {
            decision = Decision::Cancel;
        }

        let (status, error) = match &decision {
            Decision::Succeed => (HistoryStatus::Succeeded, None),
            Decision::Retry { error, .. } => (HistoryStatus::RetryScheduled, Some(error.clone())),
            Decision::Fail { error } => (HistoryStatus::Failed, Some(error.clone())),
            Decision::Cancel => (HistoryStatus::Cancelled, None),
        };

        let record = JobHistoryRecord {
            run_id,
            pipeline: job.pipeline.clone(),
            started_at: Some(started_at),
            finished_at,
            status,
            attempt: job.attempt,
            error: error.clone(),
        };
        append_history(self.ctx.history.as_ref(), record, self.ctx.history_timeout).await;
        if matches!(decision, Decision::Retry { .. } | Decision::Fail { .. }) {
            state.record_failure(&job, finished_at);
        }

        let event = match &decision {
            Decision::Retry { delay, error } => {
                let delay = jittered(*delay, job.spec.retry.jitter, &mut rand::rng());
                let trigger_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| finished_at.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                state.schedule_retry(run_id, trigger_at);
                info!(delay = ?delay, error = %error, "attempt failed, retry scheduled");
                SchedulerEvent::RetryScheduled {
                    run_id,
                    pipeline: job.pipeline.clone(),
                    next_attempt: job.attempt + 1,
                    trigger_at,
                    error: error.clone(),
                }
            }
            _ => {
                state.remove(run_id);
                match &error {
                    Some(error) => warn!(status = %status, error = %error, "run finished"),
                    None => info!(status = %status, "run finished"),
                }
                SchedulerEvent::Finished {
                    run_id,
                    pipeline: job.pipeline.clone(),
                    status,
                    error,
                }
            }
        };
        drop(state);

        if let Some(alert) = alert_for(&job, &decision) {
            self.ctx.alerts.notify(alert);
        }
        let _ = self.ctx.events.send(event);
        self.ctx.wake.notify_one();
    }
}

/// Append `record`, giving up after `limit`. Failures are logged only.
///
/// Callers hold the state lock, so a slow store must not stall scheduling
/// for longer than `limit`.
pub(crate) async fn append_history(
    history: &dyn HistoryStore,
    record: JobHistoryRecord,
    limit: Duration,
) {
    let run_id = record.run_id;
    match tokio::time::timeout(limit, history.append(record)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(run_id = %run_id, error = %e, "failed to record job history"),
        Err(_) => error!(run_id = %run_id, timeout = ?limit, "timed out recording job history"),
    }
}

fn outcome_of(joined: Result<PipelineOutcome, JoinError>) -> AttemptOutcome {
    match joined {
        Ok(outcome) => outcome.into(),
        Err(e) if e.is_panic() => {
            let panic = e.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            AttemptOutcome::Fatal(format!("pipeline panicked: {message}"))
        }
        Err(e) => AttemptOutcome::Fatal(format!("pipeline task failed: {e}")),
    }
}
