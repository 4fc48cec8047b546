//! Scheduler run command.

use anyhow::{Context, Result};
use relay_config::load_config;
use relay_core::RunId;
use relay_core::history::HistoryStatus;
use relay_db::{HistoryStore, InMemoryHistoryStore, PgHistoryStore, create_pool, run_migrations};
use relay_runner::ShellRunner;
use relay_scheduler::{RunSnapshot, RunnerSet, Scheduler, SchedulerEvent};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run the scheduler until interrupted, or until idle with `exit_when_idle`.
pub async fn run(
    config_path: &Path,
    submit: Vec<String>,
    exit_when_idle: bool,
    database_url: Option<String>,
) -> Result<()> {
    let config = load_config(config_path)
        .with_context(|| format!("Failed to load config file: {}", config_path.display()))?;

    let history: Arc<dyn HistoryStore> = match database_url {
        Some(url) => {
            let pool = create_pool(&url)
                .await
                .context("Failed to connect to database")?;
            run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            info!("Using PostgreSQL job history");
            Arc::new(PgHistoryStore::new(pool))
        }
        None => Arc::new(InMemoryHistoryStore::new()),
    };

    // Commands run relative to the directory holding the config file.
    let working_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .canonicalize()
        .context("Failed to resolve working directory")?;

    let cancel_grace = config.scheduler.cancel_grace;
    let runner = Arc::new(ShellRunner::new().with_working_dir(working_dir));
    let scheduler = Scheduler::builder(config)
        .runners(RunnerSet::new().with_fallback(runner))
        .history(history)
        .build()
        .context("Failed to build scheduler")?;

    let printer = tokio::spawn(print_events(scheduler.subscribe()));
    let shutdown = CancellationToken::new();
    let scheduler_loop = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    let mut submitted = Vec::new();
    for pipeline in &submit {
        let run_id = scheduler
            .submit(pipeline, None)
            .await
            .with_context(|| format!("Failed to submit pipeline: {}", pipeline))?;
        submitted.push(run_id);
    }

    let interrupted = if exit_when_idle {
        tokio::select! {
            _ = scheduler.wait_idle() => false,
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                true
            }
        }
    } else {
        serve(&scheduler, config_path).await?;
        true
    };

    if interrupted {
        info!("Shutting down, cancelling active runs");
        let cancelled = scheduler.cancel_all().await;
        if cancelled > 0
            && tokio::time::timeout(cancel_grace + Duration::from_secs(5), scheduler.wait_idle())
                .await
                .is_err()
        {
            warn!("Active runs did not stop in time");
        }
    }

    shutdown.cancel();
    scheduler_loop.await.context("Scheduler task failed")?;

    let failed = if exit_when_idle && !interrupted {
        count_failed(&scheduler, &submitted).await
    } else {
        0
    };

    // Dropping the last handle closes the event stream once the printer has drained it.
    drop(scheduler);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    if failed > 0 {
        anyhow::bail!("{} submitted run(s) did not succeed", failed);
    }
    Ok(())
}

/// Wait for ctrl-c, reloading the pipeline registry on SIGHUP.
#[cfg(unix)]
async fn serve(scheduler: &Scheduler, config_path: &Path) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                return Ok(());
            }
            _ = hangup.recv() => reload(scheduler, config_path).await,
        }
    }
}

#[cfg(not(unix))]
async fn serve(_scheduler: &Scheduler, _config_path: &Path) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}

#[cfg_attr(not(unix), allow(dead_code))]
async fn reload(scheduler: &Scheduler, config_path: &Path) {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Reload failed, keeping current pipelines");
            return;
        }
    };
    if let Err(e) = scheduler.reload(config.registry).await {
        error!(error = %e, "Reload failed, keeping current pipelines");
    }
}

async fn print_events(mut events: broadcast::Receiver<SchedulerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => print_event(&event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event display fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::Submitted {
            run_id, pipeline, ..
        } => println!("○ {} submitted ({})", pipeline, run_id),
        SchedulerEvent::Dispatched {
            pipeline, attempt, ..
        } => println!("▶ {} started (attempt {})", pipeline, attempt),
        SchedulerEvent::RetryScheduled {
            pipeline,
            next_attempt,
            trigger_at,
            error,
            ..
        } => println!(
            "↻ {} failed: {}; attempt {} at {}",
            pipeline,
            error,
            next_attempt,
            trigger_at.format("%H:%M:%S%.3f")
        ),
        SchedulerEvent::Finished {
            pipeline,
            status,
            error,
            ..
        } => match status {
            HistoryStatus::Succeeded => println!("✓ {} succeeded", pipeline),
            HistoryStatus::Cancelled => println!("⊘ {} cancelled", pipeline),
            _ => println!(
                "✗ {} failed: {}",
                pipeline,
                error.as_deref().unwrap_or("unknown error")
            ),
        },
    }
}

async fn count_failed(scheduler: &Scheduler, runs: &[RunId]) -> usize {
    let mut failed = 0;
    for run_id in runs {
        match scheduler.status(*run_id).await {
            Ok(RunSnapshot::Finished(record)) if record.status == HistoryStatus::Succeeded => {}
            Ok(_) => failed += 1,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Could not determine run outcome");
                failed += 1;
            }
        }
    }
    failed
}
