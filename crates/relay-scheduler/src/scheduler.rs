//! The scheduler service.
//!
//! Owns the pipeline registry, the scheduler state and the executor, and
//! drives the scheduling loop. All public operations go through
//! [`Scheduler`], which is cheap to clone and safe to share across tasks.

use chrono::{DateTime, Utc};
use relay_config::{RelayConfig, SchedulerSettings, validate_registry};
use relay_core::RunId;
use relay_core::history::{HistoryStatus, JobHistoryRecord};
use relay_core::job::{JobContext, TriggerKind};
use relay_core::pipeline::PipelineRegistry;
use relay_db::{HistoryStore, InMemoryHistoryStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{AlertManager, alert_for};
use crate::error::{BuildError, CancelError, QueryError, ReloadError, SubmitError};
use crate::events::SchedulerEvent;
use crate::executor::{ExecutorContext, PipelineExecutor, RunnerSet, append_history};
use crate::resolver::ConflictResolver;
use crate::resources::{ResourceManager, ResourceUsage};
use crate::retry::Decision;
use crate::state::SchedulerState;
use crate::triggers::CronTriggers;

/// Result of a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunSnapshot {
    /// The run is pending, queued or running.
    Active(JobContext),
    /// The run reached a terminal state.
    Finished(JobHistoryRecord),
}

/// How a cancellation request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// The run was not running and is now `Cancelled`.
    Immediate,
    /// The run is executing; it ends `Cancelled` once the attempt stops.
    Requested,
}

pub struct SchedulerBuilder {
    config: RelayConfig,
    runners: RunnerSet,
    history: Option<Arc<dyn HistoryStore>>,
    alerts: Option<AlertManager>,
}

impl SchedulerBuilder {
    pub fn runners(mut self, runners: RunnerSet) -> Self {
        self.runners = runners;
        self
    }

    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Replace the alert sinks declared in the configuration.
    pub fn alerts(mut self, alerts: AlertManager) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Fails only if an alert sink from the configuration cannot be set up.
    pub fn build(self) -> Result<Scheduler, BuildError> {
        let RelayConfig {
            scheduler: settings,
            resources,
            alerts,
            registry,
        } = self.config;

        let history = self
            .history
            .unwrap_or_else(|| Arc::new(InMemoryHistoryStore::new()));
        let alerts = match self.alerts {
            Some(alerts) => alerts,
            None => AlertManager::from_config(&alerts)?,
        };
        let state = Arc::new(Mutex::new(SchedulerState::new(ResourceManager::new(resources))));
        let wake = Arc::new(Notify::new());
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));

        let executor = PipelineExecutor::new(
            self.runners,
            settings.cancel_grace,
            ExecutorContext {
                state: Arc::clone(&state),
                history: Arc::clone(&history),
                alerts: alerts.clone(),
                events: events.clone(),
                wake: Arc::clone(&wake),
                history_timeout: settings.history_timeout,
            },
        );

        Ok(Scheduler {
            inner: Arc::new(Inner {
                triggers: Mutex::new(CronTriggers::from_registry(&registry, Utc::now())),
                registry: RwLock::new(registry),
                state,
                resolver: ConflictResolver::from_settings(&settings),
                executor: Arc::new(executor),
                history,
                alerts,
                events,
                wake,
                settings,
            }),
        })
    }
}

struct Inner {
    registry: RwLock<PipelineRegistry>,
    triggers: Mutex<CronTriggers>,
    state: Arc<Mutex<SchedulerState>>,
    resolver: ConflictResolver,
    executor: Arc<PipelineExecutor>,
    history: Arc<dyn HistoryStore>,
    alerts: AlertManager,
    events: broadcast::Sender<SchedulerEvent>,
    wake: Arc<Notify>,
    settings: SchedulerSettings,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn builder(config: RelayConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            runners: RunnerSet::new(),
            history: None,
            alerts: None,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Queue a manual run of `pipeline`, ready immediately.
    pub async fn submit(&self, pipeline: &str, priority: Option<i32>) -> Result<RunId, SubmitError> {
        let job = {
            let registry = self.inner.registry.read().await;
            let config = registry
                .get(pipeline)
                .ok_or_else(|| SubmitError::UnknownPipeline(pipeline.to_string()))?;
            if !config.enabled {
                return Err(SubmitError::PipelineDisabled(pipeline.to_string()));
            }
            JobContext::new(config, priority, TriggerKind::Manual, Utc::now())
        };

        let run_id = job.run_id;
        info!(run_id = %run_id, pipeline = %pipeline, priority = job.priority, "run submitted");
        self.enqueue(job).await;
        Ok(run_id)
    }

    async fn enqueue(&self, job: JobContext) {
        let event = SchedulerEvent::Submitted {
            run_id: job.run_id,
            pipeline: job.pipeline.clone(),
            trigger: job.trigger,
        };
        self.inner.state.lock().await.insert(job);
        self.emit(event);
        self.inner.wake.notify_one();
    }

    /// Live runs are reported from memory, finished ones from history.
    pub async fn status(&self, run_id: RunId) -> Result<RunSnapshot, QueryError> {
        if let Some(job) = self.inner.state.lock().await.get(run_id) {
            return Ok(RunSnapshot::Active(job.clone()));
        }
        match self.inner.history.terminal(run_id).await? {
            Some(record) => Ok(RunSnapshot::Finished(record)),
            None => Err(QueryError::NotFound(run_id)),
        }
    }

    /// Every pending, queued and running run, oldest submission first.
    pub async fn list_active(&self) -> Vec<JobContext> {
        self.inner.state.lock().await.snapshot()
    }

    /// History of `pipeline`, most recent first.
    pub async fn list_history(
        &self,
        pipeline: &str,
        limit: usize,
    ) -> Result<Vec<JobHistoryRecord>, QueryError> {
        Ok(self.inner.history.list(pipeline, limit).await?)
    }

    pub async fn resource_usage(&self) -> Vec<ResourceUsage> {
        self.inner.state.lock().await.resource_usage()
    }

    /// Cancel a run.
    ///
    /// A run that is not executing is cancelled on the spot. A running one is
    /// signalled and ends `Cancelled` once its attempt has stopped and its
    /// resources are released.
    pub async fn cancel(&self, run_id: RunId) -> Result<Cancellation, CancelError> {
        let mut state = self.inner.state.lock().await;

        let Some(job) = state.get_mut(run_id) else {
            drop(state);
            return match self.inner.history.terminal(run_id).await? {
                Some(_) => Err(CancelError::AlreadyTerminal(run_id)),
                None => Err(CancelError::NotFound(run_id)),
            };
        };

        if job.status.is_running() {
            job.cancel_requested = true;
            if !self.inner.executor.cancel(run_id) {
                debug!(run_id = %run_id, "attempt already finishing");
            }
            info!(run_id = %run_id, pipeline = %job.pipeline, "cancellation requested");
            return Ok(Cancellation::Requested);
        }

        let Some(job) = state.remove(run_id) else {
            return Err(CancelError::NotFound(run_id));
        };
        let record = JobHistoryRecord {
            run_id,
            pipeline: job.pipeline.clone(),
            started_at: None,
            finished_at: Utc::now(),
            status: HistoryStatus::Cancelled,
            attempt: job.attempt,
            error: None,
        };
        append_history(
            self.inner.history.as_ref(),
            record,
            self.inner.settings.history_timeout,
        )
        .await;
        drop(state);

        info!(run_id = %run_id, pipeline = %job.pipeline, "run cancelled");
        if let Some(alert) = alert_for(&job, &Decision::Cancel) {
            self.inner.alerts.notify(alert);
        }
        self.emit(SchedulerEvent::Finished {
            run_id,
            pipeline: job.pipeline,
            status: HistoryStatus::Cancelled,
            error: None,
        });
        self.inner.wake.notify_one();
        Ok(Cancellation::Immediate)
    }

    /// Cancel every active run. Returns how many were cancelled or signalled.
    pub async fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for job in self.list_active().await {
            match self.cancel(job.run_id).await {
                Ok(_) => cancelled += 1,
                Err(CancelError::NotFound(_) | CancelError::AlreadyTerminal(_)) => {}
                Err(e) => warn!(run_id = %job.run_id, error = %e, "failed to cancel run"),
            }
        }
        cancelled
    }

    /// Swap in a new pipeline registry.
    ///
    /// Runs already submitted keep the definition they were submitted with.
    /// Resource capacities are fixed for the lifetime of the scheduler, so
    /// the new registry is validated against them.
    pub async fn reload(&self, registry: PipelineRegistry) -> Result<(), ReloadError> {
        let capacities = self.inner.state.lock().await.resources().capacities();
        validate_registry(&registry, &capacities)?;

        let count = registry.len();
        self.inner
            .triggers
            .lock()
            .await
            .reconcile(&registry, Utc::now());
        *self.inner.registry.write().await = registry;

        info!(pipelines = count, "pipeline registry reloaded");
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Whether no run is pending, queued or running.
    pub async fn is_idle(&self) -> bool {
        self.inner.state.lock().await.is_empty()
    }

    /// Wait until no run is active. Requires the loop to be running.
    pub async fn wait_idle(&self) {
        let mut events = self.subscribe();
        loop {
            if self.is_idle().await {
                return;
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// One scheduling cycle at `now`: fire due cron triggers, promote due
    /// runs and dispatch everything that is safe to start.
    ///
    /// Returns the number of runs dispatched.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> usize {
        let due = self.inner.triggers.lock().await.due(now);
        for pipeline in due {
            self.fire_schedule(&pipeline, now).await;
        }

        let mut state = self.inner.state.lock().await;
        state.promote_due(now);
        let dispatched = self.inner.resolver.select(&mut state, now);
        let count = dispatched.len();
        for dispatch in dispatched {
            self.inner.executor.launch(dispatch);
        }
        count
    }

    async fn fire_schedule(&self, pipeline: &str, now: DateTime<Utc>) {
        let job = {
            let registry = self.inner.registry.read().await;
            match registry.get(pipeline) {
                Some(config) if config.enabled => {
                    JobContext::new(config, None, TriggerKind::Schedule, now)
                }
                _ => return,
            }
        };

        let previous_active = self
            .inner
            .state
            .lock()
            .await
            .jobs()
            .any(|j| j.pipeline == pipeline && j.trigger == TriggerKind::Schedule);
        if previous_active {
            warn!(pipeline = %pipeline, "previous scheduled run still active, skipping cron fire");
            return;
        }

        info!(run_id = %job.run_id, pipeline = %pipeline, "cron trigger fired");
        self.enqueue(job).await;
    }

    /// How long the loop may sleep after a cycle at `now`.
    async fn next_wake(&self, now: DateTime<Utc>) -> Duration {
        let pending = self.inner.state.lock().await.next_trigger_at();
        let cron = self.inner.triggers.lock().await.next_fire();

        let tick = self.inner.settings.tick;
        match pending.into_iter().chain(cron).min() {
            Some(at) => (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .max(Duration::from_millis(1))
                .min(tick),
            None => tick,
        }
    }

    /// Drive the scheduling loop until `shutdown` fires.
    ///
    /// The loop wakes on submissions, completions, the earliest pending
    /// trigger time and otherwise every `tick`. In-flight runs are left to
    /// finish; use [`Scheduler::cancel_all`] to stop them.
    pub async fn run(&self, shutdown: CancellationToken) {
        let pipelines = self.inner.registry.read().await.len();
        info!(tick = ?self.inner.settings.tick, pipelines, "scheduler started");
        loop {
            let now = Utc::now();
            let dispatched = self.run_cycle(now).await;
            if dispatched > 0 {
                debug!(dispatched, "scheduling cycle");
            }

            let sleep_for = self.next_wake(now).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!(in_flight = self.inner.executor.in_flight(), "scheduler stopped");
    }
}
