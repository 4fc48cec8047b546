//! Job history store.

mod memory;
mod postgres;

pub use memory::InMemoryHistoryStore;
pub use postgres::{HistoryRow, PgHistoryStore};

use async_trait::async_trait;
use relay_core::RunId;
use relay_core::history::JobHistoryRecord;

use crate::DbResult;

/// Append-only store of job execution attempts.
///
/// A run has any number of non-terminal (`retry_scheduled`) records and at
/// most one terminal record; appending a second terminal record fails with
/// `DbError::Duplicate`.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: JobHistoryRecord) -> DbResult<()>;

    /// Records of `pipeline`, most recent first.
    async fn list(&self, pipeline: &str, limit: usize) -> DbResult<Vec<JobHistoryRecord>>;

    /// All records of one run, most recent first.
    async fn list_run(&self, run_id: RunId) -> DbResult<Vec<JobHistoryRecord>>;

    /// The terminal record of a run, if it has finished.
    async fn terminal(&self, run_id: RunId) -> DbResult<Option<JobHistoryRecord>> {
        Ok(self
            .list_run(run_id)
            .await?
            .into_iter()
            .find(|r| r.status.is_terminal()))
    }
}
