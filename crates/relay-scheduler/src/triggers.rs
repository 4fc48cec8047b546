//! Cron triggers.
//!
//! Tracks the next fire time of every enabled, cron-scheduled pipeline.
//! Fire times missed while the loop was busy collapse into a single run.

use chrono::{DateTime, Utc};
use cron::Schedule;
use relay_core::pipeline::{PipelineRegistry, Trigger};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CronEntry {
    expression: String,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct CronTriggers {
    entries: BTreeMap<String, CronEntry>,
}

impl CronTriggers {
    pub fn from_registry(registry: &PipelineRegistry, now: DateTime<Utc>) -> Self {
        let mut triggers = Self::default();
        triggers.reconcile(registry, now);
        triggers
    }

    /// Bring the entries in line with `registry`.
    ///
    /// Pipelines whose cron expression is unchanged keep their next fire
    /// time; new or changed ones are computed from `now`.
    pub fn reconcile(&mut self, registry: &PipelineRegistry, now: DateTime<Utc>) {
        let mut entries = BTreeMap::new();
        for pipeline in registry.iter().filter(|p| p.enabled) {
            let Trigger::Schedule { cron } = &pipeline.trigger else {
                continue;
            };

            if let Some(existing) = self.entries.remove(&pipeline.name) {
                if existing.expression == *cron {
                    entries.insert(pipeline.name.clone(), existing);
                    continue;
                }
            }

            match Schedule::from_str(cron) {
                Ok(schedule) => {
                    let next = schedule.after(&now).next();
                    debug!(pipeline = %pipeline.name, cron = %cron, next = ?next, "cron trigger armed");
                    entries.insert(
                        pipeline.name.clone(),
                        CronEntry {
                            expression: cron.clone(),
                            schedule,
                            next,
                        },
                    );
                }
                Err(e) => {
                    warn!(pipeline = %pipeline.name, cron = %cron, error = %e, "ignoring invalid cron expression");
                }
            }
        }
        self.entries = entries;
    }

    /// Pipelines due at `now`. Each returned entry is advanced past `now`.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        for (name, entry) in &mut self.entries {
            if let Some(next) = entry.next {
                if next <= now {
                    due.push(name.clone());
                    entry.next = entry.schedule.after(&now).next();
                }
            }
        }
        due
    }

    /// Earliest upcoming fire time.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.entries.values().filter_map(|e| e.next).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
