//! Alert decisions and delivery.
//!
//! `alert_for` decides whether an outcome warrants a notification.
//! `AlertManager` fans events out to the configured sinks without waiting for
//! delivery; a failing sink is logged and otherwise ignored.

use async_trait::async_trait;
use relay_config::AlertSinkConfig;
use relay_core::alert::{AlertEvent, AlertOutcome, Severity};
use relay_core::job::JobContext;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::retry::Decision;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// The alert, if any, for `decision` on `job`'s current attempt.
///
/// Retries produce a warning, terminal failure a critical alert, operator
/// cancellation a warning, and success an info alert only when the pipeline
/// asked for one.
pub fn alert_for(job: &JobContext, decision: &Decision) -> Option<AlertEvent> {
    let (severity, outcome, error) = match decision {
        Decision::Succeed if job.spec.notify_on_success => {
            (Severity::Info, AlertOutcome::Succeeded, None)
        }
        Decision::Succeed => return None,
        Decision::Retry { error, .. } => (
            Severity::Warning,
            AlertOutcome::RetryScheduled,
            Some(error.clone()),
        ),
        Decision::Fail { error } => (Severity::Critical, AlertOutcome::Failed, Some(error.clone())),
        Decision::Cancel => (Severity::Warning, AlertOutcome::Cancelled, None),
    };

    Some(AlertEvent {
        run_id: job.run_id,
        pipeline: job.pipeline.clone(),
        severity,
        outcome,
        attempt: job.attempt,
        error,
    })
}

/// A destination for alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Events below this severity are not delivered to this sink.
    fn min_severity(&self) -> Severity {
        Severity::Info
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError>;
}

/// Writes alerts to the log.
#[derive(Debug, Clone)]
pub struct LogAlertSink {
    min_severity: Severity,
}

impl LogAlertSink {
    pub fn new(min_severity: Severity) -> Self {
        Self { min_severity }
    }
}

impl Default for LogAlertSink {
    fn default() -> Self {
        Self::new(Severity::Info)
    }
}

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError> {
        let error = event.error.as_deref().unwrap_or("");
        match event.severity {
            Severity::Info => info!(
                run_id = %event.run_id,
                pipeline = %event.pipeline,
                outcome = ?event.outcome,
                attempt = event.attempt,
                "alert"
            ),
            Severity::Warning => warn!(
                run_id = %event.run_id,
                pipeline = %event.pipeline,
                outcome = ?event.outcome,
                attempt = event.attempt,
                error,
                "alert"
            ),
            Severity::Critical => error!(
                run_id = %event.run_id,
                pipeline = %event.pipeline,
                outcome = ?event.outcome,
                attempt = event.attempt,
                error,
                "alert"
            ),
        }
        Ok(())
    }
}

/// POSTs alerts as JSON to a URL.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: Url,
    min_severity: Severity,
}

impl WebhookAlertSink {
    /// Build a sink with a 10s request timeout.
    pub fn new(url: Url, min_severity: Severity) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url,
            min_severity,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError> {
        let response = self.client.post(self.url.clone()).json(event).send().await?;
        if !response.status().is_success() {
            return Err(AlertError::Rejected(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Fire-and-forget fan-out to alert sinks.
#[derive(Clone, Default)]
pub struct AlertManager {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Build sinks from configuration.
    pub fn from_config(configs: &[AlertSinkConfig]) -> Result<Self, AlertError> {
        let mut manager = Self::new();
        for config in configs {
            let sink: Arc<dyn AlertSink> = match config {
                AlertSinkConfig::Log { min_severity } => Arc::new(LogAlertSink::new(*min_severity)),
                AlertSinkConfig::Webhook { url, min_severity } => {
                    Arc::new(WebhookAlertSink::new(url.clone(), *min_severity)?)
                }
            };
            manager = manager.with_sink(sink);
        }
        Ok(manager)
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Hand `event` to every interested sink. Returns immediately.
    pub fn notify(&self, event: AlertEvent) {
        let event = Arc::new(event);
        for sink in &self.sinks {
            if event.severity < sink.min_severity() {
                continue;
            }
            let sink = Arc::clone(sink);
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                if let Err(e) = sink.deliver(&event).await {
                    warn!(
                        sink = sink.name(),
                        run_id = %event.run_id,
                        error = %e,
                        "alert delivery failed"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_core::job::TriggerKind;
    use relay_core::pipeline::PipelineConfig;
    use tokio::sync::mpsc;

    struct ChannelSink {
        tx: mpsc::UnboundedSender<AlertEvent>,
        min: Severity,
    }

    #[async_trait]
    impl AlertSink for ChannelSink {
        fn name(&self) -> &'static str {
            "channel"
        }

        fn min_severity(&self) -> Severity {
            self.min
        }

        async fn deliver(&self, event: &AlertEvent) -> Result<(), AlertError> {
            let _ = self.tx.send(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn deliver(&self, _event: &AlertEvent) -> Result<(), AlertError> {
            Err(AlertError::Rejected("always".into()))
        }
    }

    fn job(notify_on_success: bool) -> JobContext {
        let mut config = PipelineConfig::new("sync", 1);
        config.notify_on_success = notify_on_success;
        JobContext::new(&config, None, TriggerKind::Manual, Utc::now())
    }

    #[test]
    fn test_success_alert_only_when_wanted() {
        assert!(alert_for(&job(false), &Decision::Succeed).is_none());
        let event = alert_for(&job(true), &Decision::Succeed).unwrap();
        assert_eq!(event.severity, Severity::Info);
        assert_eq!(event.outcome, AlertOutcome::Succeeded);
    }

    #[test]
    fn test_failure_is_critical() {
        let event = alert_for(
            &job(false),
            &Decision::Fail {
                error: "boom".into(),
            },
        )
        .unwrap();
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.error.as_deref(), Some("boom"));
        assert!(event.outcome.is_terminal());
    }

    #[test]
    fn test_retry_is_informational() {
        let event = alert_for(
            &job(false),
            &Decision::Retry {
                delay: Duration::from_secs(1),
                error: "reset".into(),
            },
        )
        .unwrap();
        assert_eq!(event.severity, Severity::Warning);
        assert!(!event.outcome.is_terminal());
    }

    #[tokio::test]
    async fn test_manager_filters_by_severity_and_survives_failures() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = AlertManager::new()
            .with_sink(Arc::new(FailingSink))
            .with_sink(Arc::new(ChannelSink {
                tx,
                min: Severity::Critical,
            }));

        let warning = alert_for(&job(false), &Decision::Cancel).unwrap();
        let critical = alert_for(
            &job(false),
            &Decision::Fail {
                error: "boom".into(),
            },
        )
        .unwrap();
        manager.notify(warning);
        manager.notify(critical.clone());

        let received = rx.recv().await.unwrap();
        assert_eq!(received, critical);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_from_config() {
        let manager = AlertManager::from_config(&[
            AlertSinkConfig::Log {
                min_severity: Severity::Info,
            },
            AlertSinkConfig::Webhook {
                url: Url::parse("https://hooks.example.com/relay").unwrap(),
                min_severity: Severity::Critical,
            },
        ])
        .unwrap();
        assert_eq!(manager.sink_count(), 2);
    }

    #[tokio::test]
    async fn test_webhook_rejection_is_reported() {
        // Nothing listens on this port, so the connection is refused.
        let url = Url::parse("http://127.0.0.1:9/relay").unwrap();
        let sink = WebhookAlertSink::new(url, Severity::Warning).unwrap();
        assert_eq!(sink.min_severity(), Severity::Warning);

        let event = alert_for(&job(false), &Decision::Cancel).unwrap();
        assert!(matches!(sink.deliver(&event).await, Err(AlertError::Http(_))));
    }
}
