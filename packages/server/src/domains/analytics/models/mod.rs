pub mod usage_event;

pub use usage_event::{UsageEvent, USAGE_EVENT_RETENTION_DAYS};
