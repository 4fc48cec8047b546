//! Cross-reference validation of a parsed configuration.

use relay_core::pipeline::PipelineRegistry;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::{ConfigError, ConfigResult, RelayConfig};

/// Longest accepted `max-backoff`.
pub const MAX_BACKOFF_LIMIT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Validate a whole configuration.
pub fn validate(config: &RelayConfig) -> ConfigResult<()> {
    if config.scheduler.tick.is_zero() {
        return Err(ConfigError::invalid("tick", "must be greater than zero"));
    }
    if config.scheduler.escalation_threshold == 0 {
        return Err(ConfigError::invalid(
            "escalation-threshold",
            "must be at least 1",
        ));
    }
    if config.scheduler.history_timeout.is_zero() {
        return Err(ConfigError::invalid(
            "history-timeout",
            "must be greater than zero",
        ));
    }
    if config.scheduler.event_capacity == 0 {
        return Err(ConfigError::invalid("event-capacity", "must be at least 1"));
    }
    validate_registry(&config.registry, &config.resources)
}

/// Validate pipeline definitions against the declared resource capacities.
///
/// Also used when a registry is reloaded into a running scheduler.
pub fn validate_registry(
    registry: &PipelineRegistry,
    capacities: &BTreeMap<String, u32>,
) -> ConfigResult<()> {
    for pipeline in registry.iter() {
        for (resource, qty) in pipeline.resources.iter() {
            let capacity = capacities.get(resource).ok_or_else(|| {
                ConfigError::InvalidReference(format!(
                    "pipeline '{}' requires undeclared resource '{}'",
                    pipeline.name, resource
                ))
            })?;
            if qty > *capacity {
                return Err(ConfigError::invalid(
                    format!("pipeline '{}' resources.{}", pipeline.name, resource),
                    format!("needs {qty} but capacity is {capacity}"),
                ));
            }
        }

        for other in &pipeline.conflicts_with {
            if !registry.contains(other) {
                return Err(ConfigError::InvalidReference(format!(
                    "pipeline '{}' conflicts with unknown pipeline '{}'",
                    pipeline.name, other
                )));
            }
        }

        let retry = &pipeline.retry;
        let field = |name: &str| format!("pipeline '{}' retry {}", pipeline.name, name);
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid(field("max-attempts"), "must be at least 1"));
        }
        if !(retry.multiplier >= 1.0 && retry.multiplier.is_finite()) {
            return Err(ConfigError::invalid(field("multiplier"), "must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ConfigError::invalid(field("jitter"), "must be between 0 and 1"));
        }
        if retry.max_backoff > MAX_BACKOFF_LIMIT {
            return Err(ConfigError::invalid(
                field("max-backoff"),
                format!("must not exceed {MAX_BACKOFF_LIMIT:?}"),
            ));
        }
        if retry.max_backoff < retry.base_backoff {
            return Err(ConfigError::invalid(
                field("max-backoff"),
                "must not be shorter than base-backoff",
            ));
        }
    }

    Ok(())
}
