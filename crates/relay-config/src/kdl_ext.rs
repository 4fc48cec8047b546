// Helper functions for extracting values from KDL nodes

use kdl::{KdlNode, KdlValue};
use std::time::Duration;

use crate::duration::parse_duration;
use crate::{ConfigError, ConfigResult};

fn positional(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    positional(node)
        .next()
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    positional(node)
        .filter_map(|v| v.as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// First positional argument as a bool; a bare node (`notify-on-success`)
/// counts as `true`.
pub(crate) fn get_flag(node: &KdlNode) -> ConfigResult<bool> {
    match positional(node).next() {
        None => Ok(true),
        Some(v) => v.as_bool().ok_or_else(|| {
            ConfigError::invalid(node.name().value(), format!("expected a boolean, got {v}"))
        }),
    }
}

fn value_to_i64(field: &str, value: &KdlValue) -> ConfigResult<i64> {
    value
        .as_integer()
        .and_then(|i| i64::try_from(i).ok())
        .ok_or_else(|| ConfigError::invalid(field, format!("expected an integer, got {value}")))
}

pub(crate) fn get_first_int_arg(node: &KdlNode) -> ConfigResult<Option<i64>> {
    positional(node)
        .next()
        .map(|v| value_to_i64(node.name().value(), v))
        .transpose()
}

pub(crate) fn get_int_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<i64>> {
    node.get(name).map(|v| value_to_i64(name, v)).transpose()
}

pub(crate) fn get_float_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<f64>> {
    node.get(name)
        .map(|v| {
            v.as_float()
                .or_else(|| v.as_integer().map(|i| i as f64))
                .ok_or_else(|| ConfigError::invalid(name, format!("expected a number, got {v}")))
        })
        .transpose()
}

pub(crate) fn get_duration_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    get_string_prop(node, name)
        .map(|s| parse_duration(name, &s))
        .transpose()
}

pub(crate) fn get_duration_arg(node: &KdlNode) -> ConfigResult<Duration> {
    let field = node.name().value();
    let raw = get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.into()))?;
    parse_duration(field, &raw)
}

/// Narrow an integer to `u32`, rejecting negatives.
pub(crate) fn to_u32(field: &str, value: i64) -> ConfigResult<u32> {
    u32::try_from(value)
        .map_err(|_| ConfigError::invalid(field, format!("expected a non-negative integer, got {value}")))
}

pub(crate) fn to_i32(field: &str, value: i64) -> ConfigResult<i32> {
    i32::try_from(value).map_err(|_| ConfigError::invalid(field, format!("out of range: {value}")))
}
