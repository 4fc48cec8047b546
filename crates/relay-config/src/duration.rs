//! Human-readable durations (`250ms`, `30s`, `5m`, `2h`, `1d`).

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*(ms|s|m|h|d)\s*$").expect("valid regex"));

/// Parse a duration such as `"30s"`. `field` names the setting in errors.
pub fn parse_duration(field: &str, input: &str) -> ConfigResult<Duration> {
    let caps = DURATION_RE.captures(input).ok_or_else(|| {
        ConfigError::invalid(
            field,
            format!("expected a duration like '30s' or '5m', got '{input}'"),
        )
    })?;

    let amount: u64 = caps[1]
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("duration out of range: '{input}'")))?;

    let duration = match &caps[2] {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.saturating_mul(60)),
        "h" => Duration::from_secs(amount.saturating_mul(3600)),
        _ => Duration::from_secs(amount.saturating_mul(86_400)),
    };
    Ok(duration)
}
