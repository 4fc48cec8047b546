//! Pipeline execution boundary.
//!
//! The scheduler knows nothing about what a pipeline does. It hands a
//! `JobContext` to a `PipelineRunner` once per attempt and acts on the
//! reported outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::job::JobContext;

/// Result of one attempt, classified by the pipeline itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineOutcome {
    Success,
    /// Retryable failure.
    TransientFailure(String),
    /// Non-retryable failure.
    FatalFailure(String),
}

/// Runs the business logic of a pipeline.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    /// Name of this runner, for logs.
    fn name(&self) -> &'static str;

    /// Execute one attempt of `job`.
    ///
    /// Implementations must check `cancel` at safe points and return promptly
    /// once it fires. The returned outcome of a cancelled attempt is ignored.
    async fn run(&self, job: &JobContext, cancel: CancellationToken) -> PipelineOutcome;
}
