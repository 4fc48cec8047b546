//! KDL configuration parsing for the Relay pipeline scheduler.
//!
//! This crate handles parsing of:
//! - Scheduler settings
//! - Resource capacities
//! - Alert sinks
//! - Pipeline definitions
//!
//! and validates the result as a whole.

pub mod duration;
pub mod error;
pub mod pipeline;
pub mod system;
pub mod validate;

mod kdl_ext;

pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use system::{
    AlertSinkConfig, RelayConfig, SchedulerSettings, load_config, parse_config,
};
pub use validate::{validate, validate_registry};
