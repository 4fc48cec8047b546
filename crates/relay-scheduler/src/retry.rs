//! Retry decisions.
//!
//! Pure functions: given the outcome of an attempt and the run's policy,
//! decide what happens next. No clocks, no IO; jitter takes the RNG as an
//! argument.

use rand::Rng;
use relay_core::job::RunSpec;
use relay_core::pipeline::RetryPolicy;
use relay_core::runner::PipelineOutcome;
use std::time::Duration;

/// How an attempt ended, as observed by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Transient(String),
    Fatal(String),
    /// The per-pipeline timeout fired.
    TimedOut(Duration),
    /// An operator cancelled the run.
    Cancelled,
}

impl From<PipelineOutcome> for AttemptOutcome {
    fn from(outcome: PipelineOutcome) -> Self {
        match outcome {
            PipelineOutcome::Success => AttemptOutcome::Success,
            PipelineOutcome::TransientFailure(reason) => AttemptOutcome::Transient(reason),
            PipelineOutcome::FatalFailure(reason) => AttemptOutcome::Fatal(reason),
        }
    }
}

/// What to do with the run after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Succeed,
    /// Re-queue after `delay` (before jitter).
    Retry { delay: Duration, error: String },
    Fail { error: String },
    Cancel,
}

/// Un-jittered delay after failed attempt number `attempt` (1-based):
/// `min(base × multiplier^(attempt-1), max_backoff)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let secs = policy.base_backoff.as_secs_f64() * policy.multiplier.powi(exponent);
    match Duration::try_from_secs_f64(secs) {
        Ok(delay) => delay.min(policy.max_backoff),
        Err(_) => policy.max_backoff,
    }
}

/// Add up to `jitter × delay` of random extra delay. Never shortens `delay`.
pub fn jittered<R: Rng>(delay: Duration, jitter: f64, rng: &mut R) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let fraction: f64 = rng.random_range(0.0..1.0) * jitter.min(1.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * fraction)
        .ok()
        .and_then(|extra| delay.checked_add(extra))
        .unwrap_or(delay)
}

/// Decide the fate of a run after attempt number `attempt`.
pub fn decide(spec: &RunSpec, attempt: u32, outcome: &AttemptOutcome) -> Decision {
    let transient = |error: String| {
        if attempt < spec.retry.max_attempts {
            Decision::Retry {
                delay: backoff_delay(&spec.retry, attempt),
                error,
            }
        } else {
            Decision::Fail {
                error: format!("{error} (gave up after {attempt} attempts)"),
            }
        }
    };

    match outcome {
        AttemptOutcome::Success => Decision::Succeed,
        AttemptOutcome::Cancelled => Decision::Cancel,
        AttemptOutcome::Fatal(error) => Decision::Fail {
            error: error.clone(),
        },
        AttemptOutcome::Transient(error) => transient(error.clone()),
        AttemptOutcome::TimedOut(limit) => {
            let error = format!("timed out after {limit:?}");
            if spec.retry_on_timeout {
                transient(error)
            } else {
                Decision::Fail { error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use relay_core::pipeline::PipelineConfig;

    fn spec(policy: RetryPolicy) -> RunSpec {
        RunSpec::from(&PipelineConfig::new("p", 1).with_retry(policy))
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::exponential(10, Duration::from_secs(1), 2.0)
            .with_max_backoff(Duration::from_secs(5));

        let delays: Vec<Duration> = (1..=5).map(|a| backoff_delay(&policy, a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[test]
    fn test_backoff_huge_attempt_is_capped() {
        let policy = RetryPolicy::exponential(u32::MAX, Duration::from_secs(1), 10.0);
        assert_eq!(backoff_delay(&policy, 10_000), policy.max_backoff);
    }

    #[test]
    fn test_jitter_is_bounded_and_additive() {
        let mut rng = StdRng::seed_from_u64(7);
        let base = Duration::from_secs(10);
        for _ in 0..1000 {
            let delay = jittered(base, 0.2, &mut rng);
            assert!(delay >= base);
            assert!(delay < base + Duration::from_secs(2));
        }
        assert_eq!(jittered(base, 0.0, &mut rng), base);
    }

    #[test]
    fn test_jitter_near_duration_max_saturates() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(jittered(Duration::MAX, 1.0, &mut rng), Duration::MAX);
        }
        let huge = Duration::from_secs(u64::MAX / 2);
        assert!(jittered(huge, 1.0, &mut rng) >= huge);
    }

    #[test]
    fn test_transient_failure_exhausts_attempts() {
        let spec = spec(RetryPolicy::exponential(3, Duration::from_secs(1), 2.0));
        let outcome = AttemptOutcome::Transient("connection reset".into());

        let mut delays = Vec::new();
        let mut attempt = 1;
        loop {
            match decide(&spec, attempt, &outcome) {
                Decision::Retry { delay, .. } => {
                    delays.push(delay);
                    attempt += 1;
                }
                Decision::Fail { error } => {
                    assert!(error.contains("connection reset"));
                    break;
                }
                other => panic!("unexpected decision {other:?}"),
            }
        }

        assert_eq!(attempt, 3);
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[test]
    fn test_fatal_is_never_retried() {
        let spec = spec(RetryPolicy::exponential(5, Duration::from_secs(1), 2.0));
        assert_eq!(
            decide(&spec, 1, &AttemptOutcome::Fatal("bad credentials".into())),
            Decision::Fail {
                error: "bad credentials".into()
            }
        );
    }

    #[test]
    fn test_timeout_is_fatal_unless_configured() {
        let mut spec = spec(RetryPolicy::exponential(5, Duration::from_secs(1), 2.0));
        let outcome = AttemptOutcome::TimedOut(Duration::from_secs(30));
        assert!(matches!(decide(&spec, 1, &outcome), Decision::Fail { .. }));

        spec.retry_on_timeout = true;
        assert!(matches!(decide(&spec, 1, &outcome), Decision::Retry { .. }));
    }

    #[test]
    fn test_success_and_cancel() {
        let spec = spec(RetryPolicy::default());
        assert_eq!(decide(&spec, 1, &AttemptOutcome::Success), Decision::Succeed);
        assert_eq!(decide(&spec, 1, &AttemptOutcome::Cancelled), Decision::Cancel);
    }
}
