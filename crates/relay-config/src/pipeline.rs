//! Pipeline definition parsing.

use kdl::KdlNode;
use relay_core::pipeline::{PipelineConfig, RetryPolicy, Trigger};
use std::str::FromStr;

use crate::kdl_ext::*;
use crate::{ConfigError, ConfigResult};

/// Parse a `pipeline "name" priority=N { ... }` node.
pub fn parse_pipeline(node: &KdlNode) -> ConfigResult<PipelineConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;

    let priority = match get_int_prop(node, "priority")? {
        Some(p) => to_i32("priority", p)?,
        None => 0,
    };

    let mut config = PipelineConfig::new(name, priority);
    config.enabled = get_bool_prop(node, "enabled").unwrap_or(true);

    let Some(children) = node.children() else {
        return Ok(config);
    };

    for child in children.nodes() {
        match child.name().value() {
            "resources" => {
                if let Some(grandchildren) = child.children() {
                    for gc in grandchildren.nodes() {
                        let resource = gc.name().value().to_string();
                        let qty = get_first_int_arg(gc)?.unwrap_or(1);
                        let qty = to_u32(&format!("resources.{resource}"), qty)?;
                        if config.resources.get(&resource) > 0 {
                            return Err(ConfigError::Duplicate(format!(
                                "resource '{}' in pipeline '{}'",
                                resource, config.name
                            )));
                        }
                        config.resources.insert(resource, qty);
                    }
                }
            }
            "conflicts-with" => {
                config.conflicts_with.extend(get_all_string_args(child));
            }
            "retry" => {
                config.retry = parse_retry(child)?;
            }
            "schedule" => {
                config.trigger = parse_schedule(child)?;
            }
            "timeout" => {
                config.timeout = Some(get_duration_arg(child)?);
                config.retry_on_timeout = get_bool_prop(child, "retry").unwrap_or(false);
            }
            "notify-on-success" => {
                config.notify_on_success = get_flag(child)?;
            }
            "run" => {
                config.command = get_first_string_arg(child);
            }
            "env" => {
                if let Some(grandchildren) = child.children() {
                    for gc in grandchildren.nodes() {
                        let key = gc.name().value().to_string();
                        if let Some(val) = get_first_string_arg(gc) {
                            config.env.insert(key, val);
                        }
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_retry(node: &KdlNode) -> ConfigResult<RetryPolicy> {
    let defaults = RetryPolicy::default();

    let max_attempts = match get_int_prop(node, "max-attempts")? {
        Some(n) => to_u32("max-attempts", n)?,
        None => defaults.max_attempts,
    };

    Ok(RetryPolicy {
        max_attempts,
        base_backoff: get_duration_prop(node, "base-backoff")?.unwrap_or(defaults.base_backoff),
        multiplier: get_float_prop(node, "multiplier")?.unwrap_or(defaults.multiplier),
        max_backoff: get_duration_prop(node, "max-backoff")?.unwrap_or(defaults.max_backoff),
        jitter: get_float_prop(node, "jitter")?.unwrap_or(defaults.jitter),
    })
}

fn parse_schedule(node: &KdlNode) -> ConfigResult<Trigger> {
    if let Some(expr) = get_string_prop(node, "cron") {
        cron::Schedule::from_str(&expr).map_err(|e| {
            ConfigError::invalid("schedule cron", format!("invalid cron expression '{expr}': {e}"))
        })?;
        return Ok(Trigger::Schedule { cron: expr });
    }

    match get_first_string_arg(node).as_deref() {
        Some("manual") | None => Ok(Trigger::Manual),
        Some(other) => Err(ConfigError::invalid(
            "schedule",
            format!("expected cron=\"...\" or \"manual\", got '{other}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdl::KdlDocument;
    use std::time::Duration;

    fn parse_one(kdl: &str) -> ConfigResult<PipelineConfig> {
        let doc: KdlDocument = kdl.parse()?;
        parse_pipeline(&doc.nodes()[0])
    }

    #[test]
    fn test_parse_minimal_pipeline() {
        let config = parse_one(r#"pipeline "sync-customers""#).unwrap();
        assert_eq!(config.name, "sync-customers");
        assert_eq!(config.priority, 0);
        assert!(config.enabled);
        assert_eq!(config.trigger, Trigger::Manual);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_parse_full_pipeline() {
        let config = parse_one(
            r#"
            pipeline "sync-customers" priority=10 {
                resources {
                    warehouse-db 2
                    crm-api
                }
                conflicts-with "sync-accounts" "rebuild-index"
                retry max-attempts=5 base-backoff="2s" multiplier=3.0 max-backoff="10m" jitter=0.25
                schedule cron="0 */15 * * * *"
                timeout "30m"
                run "python sync.py"
                env {
                    TARGET "warehouse"
                }
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.priority, 10);
        assert_eq!(config.resources.get("warehouse-db"), 2);
        assert_eq!(config.resources.get("crm-api"), 1);
        assert_eq!(config.conflicts_with.len(), 2);
        assert!(config.conflicts_with.contains("rebuild-index"));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_backoff, Duration::from_secs(2));
        assert_eq!(config.retry.multiplier, 3.0);
        assert_eq!(config.retry.max_backoff, Duration::from_secs(600));
        assert_eq!(config.retry.jitter, 0.25);
        assert_eq!(
            config.trigger,
            Trigger::Schedule {
                cron: "0 */15 * * * *".to_string()
            }
        );
        assert_eq!(config.timeout, Some(Duration::from_secs(1800)));
        assert!(!config.retry_on_timeout);
        assert_eq!(config.command.as_deref(), Some("python sync.py"));
        assert_eq!(config.env.get("TARGET").map(String::as_str), Some("warehouse"));
    }

    #[test]
    fn test_integer_multiplier_is_accepted() {
        let config = parse_one(
            r#"
            pipeline "p" {
                retry multiplier=2
            }
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.multiplier, 2.0);
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        let result = parse_one(
            r#"
            pipeline "p" {
                schedule cron="every tuesday"
            }
            "#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_negative_quantity_is_rejected() {
        let result = parse_one(
            r#"
            pipeline "p" {
                resources {
                    db -1
                }
            }
            "#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_missing_name() {
        let result = parse_one("pipeline priority=3");
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }
}
