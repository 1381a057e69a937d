// Common types and utilities shared across the application

pub mod clock;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
