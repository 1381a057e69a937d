// Main entry point for the scaffold server

use std::sync::Arc;

use anyhow::{Context, Result};
use scaffold_core::common::{SharedClock, SystemClock};
use scaffold_core::kernel::{db, JobProcessor};
use scaffold_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scaffold_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting SaaS scaffold server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = db::connect(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;
    tracing::info!("Migrations complete");

    // Start background jobs
    let clock: SharedClock = Arc::new(SystemClock);
    let processor =
        JobProcessor::with_builtin_handlers(pool.clone(), clock, config.job_runner_config());
    let handle = processor.start();
    tracing::info!(
        poll_interval_secs = config.jobs.poll_interval.as_secs(),
        "Job processor started"
    );

    handle.run_until_shutdown().await;

    pool.close().await;
    tracing::info!("Shutdown complete");

    Ok(())
}
