//! Kernel module - server infrastructure.

pub mod db;
pub mod jobs;

pub use jobs::{JobProcessor, JobQueue, JobRunnerConfig, ProcessorHandle, SqliteJobQueue};
