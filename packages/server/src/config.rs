use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::kernel::jobs::{JobRunnerConfig, DEFAULT_LEASE_SECS, DEFAULT_MAX_ATTEMPTS};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub jobs: JobsConfig,
}

/// Background job settings
#[derive(Debug, Clone, PartialEq)]
pub struct JobsConfig {
    pub poll_interval: Duration,
    pub maintenance_interval: Duration,
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: i32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(24 * 60 * 60),
            lease_duration: Duration::from_secs(DEFAULT_LEASE_SECS as u64),
            heartbeat_interval: Duration::from_secs(60),
            batch_size: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = JobsConfig::default();

        let config = Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/scaffold.db".to_string()),
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            jobs: JobsConfig {
                poll_interval: secs_or(&lookup, "JOBS_POLL_INTERVAL_SECS", defaults.poll_interval)?,
                maintenance_interval: secs_or(
                    &lookup,
                    "JOBS_MAINTENANCE_INTERVAL_SECS",
                    defaults.maintenance_interval,
                )?,
                lease_duration: secs_or(
                    &lookup,
                    "JOBS_LEASE_DURATION_SECS",
                    defaults.lease_duration,
                )?,
                heartbeat_interval: secs_or(
                    &lookup,
                    "JOBS_HEARTBEAT_INTERVAL_SECS",
                    defaults.heartbeat_interval,
                )?,
                batch_size: parse_or(&lookup, "JOBS_BATCH_SIZE", defaults.batch_size)?,
                max_attempts: parse_or(&lookup, "JOBS_MAX_ATTEMPTS", defaults.max_attempts)?,
            },
        };

        // A lease that can lapse between two heartbeats gets reclaimed mid-run.
        if config.jobs.lease_duration <= config.jobs.heartbeat_interval {
            anyhow::bail!(
                "JOBS_LEASE_DURATION_SECS ({}) must be greater than JOBS_HEARTBEAT_INTERVAL_SECS ({})",
                config.jobs.lease_duration.as_secs(),
                config.jobs.heartbeat_interval.as_secs()
            );
        }

        Ok(config)
    }

    /// Runner settings for this process
    pub fn job_runner_config(&self) -> JobRunnerConfig {
        JobRunnerConfig {
            poll_interval: self.jobs.poll_interval,
            maintenance_interval: self.jobs.maintenance_interval,
            lease_duration: self.jobs.lease_duration,
            heartbeat_interval: self.jobs.heartbeat_interval,
            batch_size: self.jobs.batch_size,
            max_attempts: self.jobs.max_attempts,
            ..JobRunnerConfig::default()
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", key)),
        None => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_or(lookup, key, default.as_secs())?;
    if secs == 0 {
        anyhow::bail!("{} must be greater than zero", key);
    }
    Ok(Duration::from_secs(secs))
}
