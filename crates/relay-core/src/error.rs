//! Errors raised while executing a pipeline attempt.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
