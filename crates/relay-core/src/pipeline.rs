//! Pipeline definitions and the pipeline registry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// A data-integration pipeline known to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Unique pipeline name (e.g., "sync-customers").
    pub name: String,
    /// Higher runs first.
    pub priority: i32,
    /// Named resources a run must hold while executing.
    pub resources: ResourceRequirements,
    /// Pipelines that must never run concurrently with this one.
    pub conflicts_with: BTreeSet<String>,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
    /// What starts a run.
    pub trigger: Trigger,
    /// Disabled pipelines reject submissions.
    pub enabled: bool,
    /// Maximum duration of a single attempt.
    pub timeout: Option<Duration>,
    /// Treat a timeout as transient instead of fatal.
    pub retry_on_timeout: bool,
    /// Emit an info alert when a run succeeds.
    pub notify_on_success: bool,
    /// Shell command for the shell runner.
    pub command: Option<String>,
    /// Extra environment for the shell runner.
    pub env: HashMap<String, String>,
}

impl PipelineConfig {
    /// A manual, enabled pipeline with default retry policy and no resources.
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            resources: ResourceRequirements::default(),
            conflicts_with: BTreeSet::new(),
            retry: RetryPolicy::default(),
            trigger: Trigger::Manual,
            enabled: true,
            timeout: None,
            retry_on_timeout: false,
            notify_on_success: false,
            command: None,
            env: HashMap::new(),
        }
    }

    pub fn with_resource(mut self, name: impl Into<String>, quantity: u32) -> Self {
        self.resources.insert(name, quantity);
        self
    }

    pub fn with_conflict(mut self, pipeline: impl Into<String>) -> Self {
        self.conflicts_with.insert(pipeline.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Resource name to quantity needed.
///
/// Ordered so that iteration (and therefore acquisition and logging) is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements(BTreeMap<String, u32>);

impl ResourceRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `quantity` of `name`. Zero quantities are dropped.
    pub fn insert(&mut self, name: impl Into<String>, quantity: u32) {
        if quantity > 0 {
            self.0.insert(name.into(), quantity);
        }
    }

    pub fn get(&self, name: &str) -> u32 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<S: Into<String>> FromIterator<(S, u32)> for ResourceRequirements {
    fn from_iter<I: IntoIterator<Item = (S, u32)>>(iter: I) -> Self {
        let mut reqs = Self::new();
        for (name, qty) in iter {
            reqs.insert(name, qty);
        }
        reqs
    }
}

/// Exponential backoff retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_backoff: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on the un-jittered delay.
    pub max_backoff: Duration,
    /// Random extra delay as a fraction of the computed delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_backoff: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_backoff,
            multiplier,
            ..Self::default()
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}

/// What starts a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    /// Started only by an explicit submission.
    Manual,
    /// Started by a cron expression (seconds field included).
    Schedule { cron: String },
}

/// The set of known pipelines, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, PipelineConfig>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a pipeline definition.
    pub fn insert(&mut self, config: PipelineConfig) -> Option<PipelineConfig> {
        self.pipelines.insert(config.name.clone(), config)
    }

    pub fn get(&self, name: &str) -> Option<&PipelineConfig> {
        self.pipelines.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PipelineConfig> {
        self.pipelines.values()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

impl FromIterator<PipelineConfig> for PipelineRegistry {
    fn from_iter<I: IntoIterator<Item = PipelineConfig>>(iter: I) -> Self {
        let mut registry = Self::new();
        for config in iter {
            registry.insert(config);
        }
        registry
    }
}
