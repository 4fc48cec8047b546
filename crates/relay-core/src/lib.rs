//! Core domain types and traits for the Relay pipeline scheduler.
//!
//! This crate contains:
//! - Run identifiers
//! - Pipeline definitions and the pipeline registry
//! - Job context and the job state machine
//! - Job history records
//! - Alert events
//! - The pipeline execution boundary (`PipelineRunner`)

pub mod alert;
pub mod error;
pub mod history;
pub mod id;
pub mod job;
pub mod pipeline;
pub mod runner;

pub use error::{Error, Result};
pub use id::RunId;
