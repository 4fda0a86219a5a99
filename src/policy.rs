// Timing helpers for the course engine

use std::time::Duration;

/// Whether to wait `submit_delay` before submitting to an activity closing at `end_time_ms`.
/// Only activities with more than three delays left get the wait.
pub fn should_delay(end_time_ms: i64, now_ms: i64, submit_delay: Duration) -> bool {
    let remaining = end_time_ms.saturating_sub(now_ms);
    let threshold = i64::try_from(submit_delay.as_millis()).unwrap_or(i64::MAX).saturating_mul(3);
    remaining > threshold
}

pub fn unsupported_message(raw: &str) -> String {
    format!("unsupported sign kind: {raw}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_windows_are_delayed() {
        let delay = Duration::from_secs(5);
        assert!(should_delay(600_000, 0, delay));
        assert!(should_delay(15_001, 0, delay));
    }

    #[test]
    fn short_windows_submit_immediately() {
        let delay = Duration::from_secs(5);
        assert!(!should_delay(15_000, 0, delay));
        assert!(!should_delay(1_000, 0, delay));
        assert!(!should_delay(-5, 0, delay));
    }

    #[test]
    fn zero_delay_only_applies_to_open_windows() {
        assert!(should_delay(1, 0, Duration::ZERO));
        assert!(!should_delay(0, 0, Duration::ZERO));
    }
}
