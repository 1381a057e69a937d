// SaaS Scaffold - API Core
//
// Multi-tenant SaaS backend on a single embedded database. This crate holds the
// background job processor and the domain models it maintains.
//
// Job infrastructure lives in kernel/jobs; domain models in domains/*/models.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
