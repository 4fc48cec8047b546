//! Job history listing.

use anyhow::{Context, Result};
use relay_db::{HistoryStore, PgHistoryStore, create_pool};

pub async fn show(database_url: &str, pipeline: &str, limit: usize, json: bool) -> Result<()> {
    let pool = create_pool(database_url)
        .await
        .context("Failed to connect to database")?;
    let store = PgHistoryStore::new(pool);

    let records = store
        .list(pipeline, limit)
        .await
        .with_context(|| format!("Failed to load history for pipeline: {}", pipeline))?;

    if json {
        for record in &records {
            println!("{}", serde_json::to_string(record)?);
        }
        return Ok(());
    }

    if records.is_empty() {
        println!("No recorded runs for {}", pipeline);
        return Ok(());
    }

    println!(
        "{:<36}  {:>7}  {:<15}  {:<25}  ERROR",
        "RUN", "ATTEMPT", "STATUS", "FINISHED"
    );
    for record in records {
        println!(
            "{:<36}  {:>7}  {:<15}  {:<25}  {}",
            record.run_id.to_string(),
            record.attempt,
            record.status.as_str(),
            record.finished_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            record.error.unwrap_or_default()
        );
    }
    Ok(())
}
