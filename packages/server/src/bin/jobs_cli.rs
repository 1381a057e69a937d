//! CLI for inspecting and feeding the background job queue
//!
//! Talks to the same database as the server. Every command prints one JSON
//! document on stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scaffold_core::common::{SharedClock, SystemClock};
use scaffold_core::config::Config;
use scaffold_core::kernel::db;
use scaffold_core::kernel::jobs::{Job, JobQueue, JobStatus, NewJob, SqliteJobQueue};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "jobs_cli")]
#[command(about = "Background job queue CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a job
    Enqueue {
        job_type: String,
        /// JSON payload handed to the handler
        #[arg(long, default_value = "null")]
        payload: String,
        /// Seconds to wait before the job becomes eligible
        #[arg(long, default_value_t = 0)]
        delay_secs: u64,
        #[arg(long)]
        max_attempts: Option<i32>,
    },

    /// List recent jobs
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Show one job
    Show { id: i64 },

    /// Count jobs per status
    Stats,

    /// Release running jobs whose lease expired
    Reclaim,
}

// ============================================================================
// JSON Response Types
// ============================================================================

#[derive(Serialize)]
struct Response<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn output<T: Serialize>(data: T) -> Result<()> {
    let resp = Response {
        success: true,
        data: Some(data),
        message: None,
    };
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

fn output_error(message: String) {
    let resp: Response<()> = Response {
        success: false,
        data: None,
        message: Some(message),
    };
    match serde_json::to_string_pretty(&resp) {
        Ok(json) => println!("{}", json),
        Err(_) => eprintln!("{}", resp.message.unwrap_or_default()),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        output_error(format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let pool = db::connect(&config.database_url, 1).await?;
    db::run_migrations(&pool).await?;

    let clock: SharedClock = Arc::new(SystemClock);
    let lease_duration = chrono::Duration::from_std(config.jobs.lease_duration)
        .context("Lease duration out of range")?;
    let queue = SqliteJobQueue::with_lease_duration(pool.clone(), clock.clone(), lease_duration);

    match cli.command {
        Commands::Enqueue {
            job_type,
            payload,
            delay_secs,
            max_attempts,
        } => {
            // Validate, but store the caller's text unchanged.
            serde_json::from_str::<serde_json::Value>(&payload)
                .context("--payload must be valid JSON")?;

            let delay = chrono::Duration::from_std(Duration::from_secs(delay_secs))
                .context("Delay out of range")?;
            let scheduled_at = clock
                .now()
                .checked_add_signed(delay)
                .context("Delay out of range")?;
            let job = NewJob::builder()
                .job_type(job_type)
                .payload(payload)
                .scheduled_at(scheduled_at)
                .max_attempts(max_attempts.unwrap_or(config.jobs.max_attempts))
                .build();

            let job: Job = queue.enqueue(job).await?;
            output(job)?;
        }
        Commands::List { status, limit } => {
            output(queue.list_jobs(status, limit).await?)?;
        }
        Commands::Show { id } => {
            output(queue.find_by_id(id).await?)?;
        }
        Commands::Stats => {
            output(queue.count_by_status().await?)?;
        }
        Commands::Reclaim => {
            output(queue.reclaim_expired_leases().await?)?;
        }
    }

    pool.close().await;
    Ok(())
}
