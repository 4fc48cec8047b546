//! Errors returned by the scheduler service.

use relay_config::ConfigError;
use relay_core::RunId;
use relay_db::DbError;
use thiserror::Error;

use crate::alerts::AlertError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("pipeline is disabled: {0}")]
    PipelineDisabled(String),
}

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("run already finished: {0}")]
    AlreadyTerminal(RunId),

    #[error("history error: {0}")]
    History(#[from] DbError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("history error: {0}")]
    History(#[from] DbError),
}

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("invalid pipeline registry: {0}")]
    Invalid(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to set up alert sink: {0}")]
    Alerts(#[from] AlertError),
}
