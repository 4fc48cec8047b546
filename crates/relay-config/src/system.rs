//! Scheduler configuration parsing.

use kdl::{KdlDocument, KdlNode};
use relay_core::alert::Severity;
use relay_core::pipeline::PipelineRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::kdl_ext::*;
use crate::pipeline::parse_pipeline;
use crate::validate::validate;
use crate::{ConfigError, ConfigResult};

/// Everything a scheduler needs to start.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub scheduler: SchedulerSettings,
    /// Resource name to capacity.
    pub resources: BTreeMap<String, u32>,
    pub alerts: Vec<AlertSinkConfig>,
    pub registry: PipelineRegistry,
}

/// Tuning knobs for the scheduling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Longest the loop sleeps without a wake-up.
    pub tick: Duration,
    /// Consecutive denials before a job's effective priority is raised.
    pub escalation_threshold: u32,
    /// Priority added per escalation level.
    pub escalation_boost: i32,
    /// How long a cancelled or timed-out attempt may keep running before
    /// it is aborted.
    pub cancel_grace: Duration,
    /// Buffer size of the scheduler event channel.
    pub event_capacity: usize,
    /// After a run fails, other runs needing any of its resources are held
    /// back this long. Zero disables the cool-off.
    pub failure_cooloff: Duration,
    /// Upper bound on a single history write.
    pub history_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            escalation_threshold: 5,
            escalation_boost: 10,
            cancel_grace: Duration::from_secs(30),
            event_capacity: 256,
            failure_cooloff: Duration::ZERO,
            history_timeout: Duration::from_secs(5),
        }
    }
}

/// Where alerts go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlertSinkConfig {
    /// Write alerts to the log.
    Log { min_severity: Severity },
    /// POST alerts as JSON.
    Webhook { url: Url, min_severity: Severity },
}

/// Read and parse a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<RelayConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(kdl: &str) -> ConfigResult<RelayConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = RelayConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "scheduler" => {
                config.scheduler = parse_settings(node)?;
            }
            "resource" => {
                let (name, capacity) = parse_resource(node)?;
                if config.resources.insert(name.clone(), capacity).is_some() {
                    return Err(ConfigError::Duplicate(format!("resource '{name}'")));
                }
            }
            "alerts" => {
                config.alerts = parse_alerts(node)?;
            }
            "pipeline" => {
                let pipeline = parse_pipeline(node)?;
                let name = pipeline.name.clone();
                if config.registry.insert(pipeline).is_some() {
                    return Err(ConfigError::Duplicate(format!("pipeline '{name}'")));
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    validate(&config)?;
    Ok(config)
}

fn parse_settings(node: &KdlNode) -> ConfigResult<SchedulerSettings> {
    let mut settings = SchedulerSettings::default();

    let Some(children) = node.children() else {
        return Ok(settings);
    };

    for child in children.nodes() {
        let field = child.name().value();
        match field {
            "tick" => settings.tick = get_duration_arg(child)?,
            "cancel-grace" => settings.cancel_grace = get_duration_arg(child)?,
            "failure-cooloff" => settings.failure_cooloff = get_duration_arg(child)?,
            "history-timeout" => settings.history_timeout = get_duration_arg(child)?,
            "escalation-threshold" => {
                let n = get_first_int_arg(child)?
                    .ok_or_else(|| ConfigError::MissingField(field.into()))?;
                settings.escalation_threshold = to_u32(field, n)?;
            }
            "escalation-boost" => {
                let n = get_first_int_arg(child)?
                    .ok_or_else(|| ConfigError::MissingField(field.into()))?;
                settings.escalation_boost = to_i32(field, n)?;
            }
            "event-capacity" => {
                let n = get_first_int_arg(child)?
                    .ok_or_else(|| ConfigError::MissingField(field.into()))?;
                settings.event_capacity = to_u32(field, n)? as usize;
            }
            _ => {}
        }
    }

    Ok(settings)
}

fn parse_resource(node: &KdlNode) -> ConfigResult<(String, u32)> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("resource name".to_string()))?;
    let capacity = get_int_prop(node, "capacity")?
        .ok_or_else(|| ConfigError::MissingField(format!("capacity for resource '{name}'")))?;
    let capacity = to_u32("capacity", capacity)?;
    Ok((name, capacity))
}

fn parse_alerts(node: &KdlNode) -> ConfigResult<Vec<AlertSinkConfig>> {
    let mut sinks = Vec::new();

    let Some(children) = node.children() else {
        return Ok(sinks);
    };

    for child in children.nodes() {
        let min_severity = match get_string_prop(child, "min-severity") {
            Some(s) => s
                .parse::<Severity>()
                .map_err(|e| ConfigError::invalid("min-severity", e))?,
            None => Severity::Info,
        };

        match child.name().value() {
            "log" => sinks.push(AlertSinkConfig::Log { min_severity }),
            "webhook" => {
                let raw = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("webhook url".to_string()))?;
                let url = Url::parse(&raw)
                    .map_err(|e| ConfigError::invalid("webhook url", e.to_string()))?;
                sinks.push(AlertSinkConfig::Webhook { url, min_severity });
            }
            other => {
                return Err(ConfigError::invalid(
                    "alerts",
                    format!("unknown alert sink '{other}'"),
                ));
            }
        }
    }

    Ok(sinks)
}
