//! In-memory history store.

use async_trait::async_trait;
use relay_core::RunId;
use relay_core::history::JobHistoryRecord;
use tokio::sync::RwLock;

use super::HistoryStore;
use crate::{DbError, DbResult};

/// History kept in process memory. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    records: RwLock<Vec<JobHistoryRecord>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

/// Newest first: by finish time, then by insertion order.
fn newest_first<'a>(
    records: impl DoubleEndedIterator<Item = &'a JobHistoryRecord>,
) -> Vec<JobHistoryRecord> {
    let mut out: Vec<JobHistoryRecord> = records.rev().cloned().collect();
    out.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
    out
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, record: JobHistoryRecord) -> DbResult<()> {
        let mut records = self.records.write().await;
        if record.status.is_terminal()
            && records
                .iter()
                .any(|r| r.run_id == record.run_id && r.status.is_terminal())
        {
            return Err(DbError::Duplicate(format!(
                "terminal history record for run {}",
                record.run_id
            )));
        }
        records.push(record);
        Ok(())
    }

    async fn list(&self, pipeline: &str, limit: usize) -> DbResult<Vec<JobHistoryRecord>> {
        let records = self.records.read().await;
        let mut out = newest_first(records.iter().filter(|r| r.pipeline == pipeline));
        out.truncate(limit);
        Ok(out)
    }

    async fn list_run(&self, run_id: RunId) -> DbResult<Vec<JobHistoryRecord>> {
        let records = self.records.read().await;
        Ok(newest_first(records.iter().filter(|r| r.run_id == run_id)))
    }
}
