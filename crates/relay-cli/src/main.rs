//! Relay CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay pipeline scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a scheduler configuration
    Validate {
        /// Path to the configuration file
        #[arg(env = "RELAY_CONFIG", default_value = "relay.kdl")]
        path: PathBuf,
    },
    /// Run the scheduler
    Run {
        /// Path to the configuration file
        #[arg(long, env = "RELAY_CONFIG", default_value = "relay.kdl")]
        config: PathBuf,
        /// Submit a run of this pipeline at startup (repeatable)
        #[arg(long = "submit", value_name = "PIPELINE")]
        submit: Vec<String>,
        /// Exit once no run is pending, queued or running
        #[arg(long)]
        exit_when_idle: bool,
        /// Store job history in PostgreSQL instead of memory
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
    },
    /// Show recorded runs of a pipeline
    History {
        /// Pipeline name
        pipeline: String,
        /// Maximum number of records to show
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("RELAY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Run {
            config,
            submit,
            exit_when_idle,
            database_url,
        } => {
            commands::run::run(&config, submit, exit_when_idle, database_url).await?;
        }
        Commands::History {
            pipeline,
            limit,
            json,
            database_url,
        } => {
            commands::history::show(&database_url, &pipeline, limit, json).await?;
        }
    }

    Ok(())
}
