#![allow(dead_code)]

use async_trait::async_trait;
use relay_config::{RelayConfig, SchedulerSettings};
use relay_core::alert::AlertEvent;
use relay_core::job::JobContext;
use relay_core::pipeline::{PipelineConfig, PipelineRegistry};
use relay_core::runner::{PipelineOutcome, PipelineRunner};
use relay_scheduler::{AlertError, AlertSink, Scheduler, SchedulerEvent};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn settings() -> SchedulerSettings {
    SchedulerSettings {
        tick: Duration::from_millis(20),
        escalation_threshold: 5,
        escalation_boost: 10,
        cancel_grace: Duration::from_millis(200),
        event_capacity: 1024,
        history_timeout: Duration::from_millis(500),
        ..SchedulerSettings::default()
    }
}

pub fn config(resources: &[(&str, u32)], pipelines: Vec<PipelineConfig>) -> RelayConfig {
    RelayConfig {
        scheduler: settings(),
        resources: resources
            .iter()
            .map(|(name, capacity)| (name.to_string(), *capacity))
            .collect::<BTreeMap<_, _>>(),
        alerts: Vec::new(),
        registry: pipelines.into_iter().collect::<PipelineRegistry>(),
    }
}

type Script = dyn Fn(&JobContext) -> PipelineOutcome + Send + Sync;

/// Runs for a fixed time, then reports what the script says. Honors
/// cancellation and keeps track of who ran.
pub struct ScriptRunner {
    hold: Duration,
    script: Box<Script>,
    started: Mutex<Vec<String>>,
    max_concurrent: AtomicU32,
    current: AtomicU32,
}

impl ScriptRunner {
    pub fn new(
        hold: Duration,
        script: impl Fn(&JobContext) -> PipelineOutcome + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            hold,
            script: Box::new(script),
            started: Mutex::new(Vec::new()),
            max_concurrent: AtomicU32::new(0),
            current: AtomicU32::new(0),
        })
    }

    pub fn succeeding(hold: Duration) -> Arc<Self> {
        Self::new(hold, |_| PipelineOutcome::Success)
    }

    /// Pipelines in the order their attempts started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> u32 {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineRunner for ScriptRunner {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn run(&self, job: &JobContext, cancel: CancellationToken) -> PipelineOutcome {
        self.started.lock().unwrap().push(job.pipeline.clone());
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.hold) => (self.script)(job),
            _ = cancel.cancelled() => PipelineOutcome::FatalFailure("cancelled".into()),
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Never finishes on its own and ignores cancellation.
pub struct StubbornRunner;

#[async_trait]
impl PipelineRunner for StubbornRunner {
    fn name(&self) -> &'static str {
        "stubborn"
    }

    async fn run(&self, _job: &JobContext, _cancel: CancellationToken) -> PipelineOutcome {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        PipelineOutcome::Success
    }
}

/// Forwards alerts to a channel.
pub struct ChannelSink(pub mpsc::UnboundedSender<AlertEvent>);

#[async_trait]
impl AlertSink for ChannelSink {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError> {
        let _ = self.0.send(event.clone());
        Ok(())
    }
}

/// Wait for the first event matching `pred`.
pub async fn wait_for(
    events: &mut broadcast::Receiver<SchedulerEvent>,
    pred: impl Fn(&SchedulerEvent) -> bool,
) -> SchedulerEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait until the scheduler has no active runs.
pub async fn settle(scheduler: &Scheduler) {
    tokio::time::timeout(Duration::from_secs(10), scheduler.wait_idle())
        .await
        .expect("scheduler did not become idle");
}

/// Run the scheduling loop in the background.
pub fn start(scheduler: &Scheduler) -> (CancellationToken, JoinHandle<()>) {
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });
    (shutdown, handle)
}

pub async fn stop(shutdown: CancellationToken, handle: JoinHandle<()>) {
    shutdown.cancel();
    handle.await.unwrap();
}
