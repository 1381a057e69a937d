//! Retry schedule for failed jobs.

use chrono::Duration;

/// Minutes to wait before each retry, indexed by attempts already made.
/// Attempts past the end of the table reuse the last entry.
const RETRY_SCHEDULE_MINUTES: [i64; 3] = [1, 5, 30];

/// Delay before the next attempt of a job that has failed `attempts` times.
pub fn retry_delay(attempts: i32) -> Duration {
    let index = usize::try_from(attempts.max(1) - 1)
        .unwrap_or(0)
        .min(RETRY_SCHEDULE_MINUTES.len() - 1);
    Duration::minutes(RETRY_SCHEDULE_MINUTES[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_fixed_schedule() {
        assert_eq!(retry_delay(1), Duration::minutes(1));
        assert_eq!(retry_delay(2), Duration::minutes(5));
        assert_eq!(retry_delay(3), Duration::minutes(30));
    }

    #[test]
    fn caps_at_last_entry() {
        assert_eq!(retry_delay(4), Duration::minutes(30));
        assert_eq!(retry_delay(50), Duration::minutes(30));
    }

    #[test]
    fn zero_attempts_uses_first_entry() {
        assert_eq!(retry_delay(0), Duration::minutes(1));
        assert_eq!(retry_delay(-2), Duration::minutes(1));
    }
}
