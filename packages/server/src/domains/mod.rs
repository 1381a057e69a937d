// Business domains
pub mod analytics;
pub mod auth;
