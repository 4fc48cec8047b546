//! Pipeline runners for the Relay pipeline scheduler.
//!
//! Provides `PipelineRunner` implementations:
//! - Shell commands (`ShellRunner`)

pub mod shell;

pub use relay_core::runner::{PipelineOutcome, PipelineRunner};
pub use shell::ShellRunner;
