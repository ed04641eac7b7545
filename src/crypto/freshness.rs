//! Recency checks for producer supplied timestamps.

use chrono::Utc;

/// The default freshness window in milliseconds.
pub const DEFAULT_FRESHNESS_WINDOW: u64 = 300_000;

/// Checks that `timestamp` (milliseconds since the unix epoch) lies within `window_ms` of the
/// server clock, in either direction.
pub fn is_recent(timestamp: i64, window_ms: u64) -> bool {
    is_recent_at(timestamp, Utc::now().timestamp_millis(), window_ms)
}

pub(crate) fn is_recent_at(timestamp: i64, now: i64, window_ms: u64) -> bool {
    let skew = (i128::from(now) - i128::from(timestamp)).unsigned_abs();
    skew <= u128::from(window_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_symmetric() {
        let now = 1_700_000_000_000;
        let window = DEFAULT_FRESHNESS_WINDOW as i64;

        assert!(is_recent_at(now, now, DEFAULT_FRESHNESS_WINDOW));
        assert!(is_recent_at(now - window, now, DEFAULT_FRESHNESS_WINDOW));
        assert!(is_recent_at(now + window, now, DEFAULT_FRESHNESS_WINDOW));
        assert!(!is_recent_at(now - window - 1, now, DEFAULT_FRESHNESS_WINDOW));
        assert!(!is_recent_at(now + window + 1, now, DEFAULT_FRESHNESS_WINDOW));
    }

    #[test]
    fn test_extreme_timestamps() {
        let now = Utc::now().timestamp_millis();

        assert!(is_recent(now, DEFAULT_FRESHNESS_WINDOW));
        assert!(!is_recent(i64::MIN, DEFAULT_FRESHNESS_WINDOW));
        assert!(!is_recent(i64::MAX, DEFAULT_FRESHNESS_WINDOW));
        assert!(!is_recent(0, DEFAULT_FRESHNESS_WINDOW));
    }
}
