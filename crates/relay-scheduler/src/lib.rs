//! Job scheduling for the Relay pipeline scheduler.
//!
//! This crate contains:
//! - The resource registry (`ResourceManager`)
//! - Scheduler state and the dispatch resolver
//! - Retry and alert decisions
//! - Alert delivery
//! - The pipeline executor
//! - Cron triggers
//! - The `Scheduler` service and its scheduling loop

pub mod alerts;
pub mod error;
pub mod events;
pub mod executor;
pub mod resolver;
pub mod resources;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod triggers;

pub use alerts::{AlertError, AlertManager, AlertSink, LogAlertSink, WebhookAlertSink};
pub use error::{BuildError, CancelError, QueryError, ReloadError, SubmitError};
pub use events::SchedulerEvent;
pub use executor::{PipelineExecutor, RunnerSet};
pub use resolver::ConflictResolver;
pub use resources::{ResourceDenied, ResourceGrant, ResourceManager, ResourceUsage};
pub use scheduler::{Cancellation, RunSnapshot, Scheduler, SchedulerBuilder};
pub use state::SchedulerState;
