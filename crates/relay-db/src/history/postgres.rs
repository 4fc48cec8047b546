//! PostgreSQL history store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::RunId;
use relay_core::history::{HistoryStatus, JobHistoryRecord};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::HistoryStore;
use crate::{DbError, DbResult};

/// A row of the `job_history` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistoryRow {
    pub id: i64,
    pub run_id: uuid::Uuid,
    pub pipeline: String,
    pub attempt: i32,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl TryFrom<HistoryRow> for JobHistoryRecord {
    type Error = DbError;

    fn try_from(row: HistoryRow) -> DbResult<Self> {
        let status: HistoryStatus = row.status.parse().map_err(DbError::Corrupt)?;
        let attempt = u32::try_from(row.attempt)
            .map_err(|_| DbError::Corrupt(format!("negative attempt in row {}", row.id)))?;
        Ok(JobHistoryRecord {
            run_id: RunId::from_uuid(row.run_id),
            pipeline: row.pipeline,
            started_at: row.started_at,
            finished_at: row.finished_at,
            status,
            attempt,
            error: row.error,
        })
    }
}

/// PostgreSQL implementation of HistoryStore.
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn append(&self, record: JobHistoryRecord) -> DbResult<()> {
        let attempt = i32::try_from(record.attempt)
            .map_err(|_| DbError::Corrupt(format!("attempt {} out of range", record.attempt)))?;

        sqlx::query(
            r#"
            INSERT INTO job_history (run_id, pipeline, attempt, status, started_at, finished_at, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.run_id.as_uuid())
        .bind(&record.pipeline)
        .bind(attempt)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DbError::Duplicate(format!("terminal history record for run {}", record.run_id))
            } else {
                DbError::Database(e)
            }
        })?;
        Ok(())
    }

    async fn list(&self, pipeline: &str, limit: usize) -> DbResult<Vec<JobHistoryRecord>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT * FROM job_history
            WHERE pipeline = $1
            ORDER BY finished_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(pipeline)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobHistoryRecord::try_from).collect()
    }

    async fn list_run(&self, run_id: RunId) -> DbResult<Vec<JobHistoryRecord>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT * FROM job_history WHERE run_id = $1 ORDER BY finished_at DESC, id DESC",
        )
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobHistoryRecord::try_from).collect()
    }
}

/// Tests that require PostgreSQL.
/// Run with: DATABASE_URL=... cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::{create_pool, run_migrations};

    async fn store() -> PgHistoryStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        PgHistoryStore::new(pool)
    }

    #[tokio::test]
    #[ignore]
    async fn test_append_and_list() {
        let store = store().await;
        let run = RunId::new();
        let pipeline = format!("pg-test-{run}");
        let now = Utc::now();

        store
            .append(JobHistoryRecord {
                run_id: run,
                pipeline: pipeline.clone(),
                started_at: Some(now),
                finished_at: now,
                status: HistoryStatus::RetryScheduled,
                attempt: 1,
                error: Some("connection reset".into()),
            })
            .await
            .unwrap();
        store
            .append(JobHistoryRecord {
                run_id: run,
                pipeline: pipeline.clone(),
                started_at: Some(now),
                finished_at: now + chrono::Duration::seconds(2),
                status: HistoryStatus::Succeeded,
                attempt: 2,
                error: None,
            })
            .await
            .unwrap();

        let listed = store.list(&pipeline, 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].status, HistoryStatus::Succeeded);
        assert_eq!(
            store.terminal(run).await.unwrap().map(|r| r.attempt),
            Some(2)
        );
    }
}
