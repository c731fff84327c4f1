use chrono::{Local, NaiveDateTime};

/// Timestamp format used throughout: matches SQLite `CURRENT_TIMESTAMP`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Epoch watermark a fresh slave cursor starts from.
pub const EPOCH_TIMESTAMP: &str = "1970-01-01 00:00:00";

/// Current wall-clock time in the store's timestamp format.
pub fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok()
}

/// Absolute difference between two formatted timestamps, in seconds.
/// Unparseable input counts as zero drift.
pub fn timestamp_drift_secs(a: &str, b: &str) -> i64 {
    match (parse_timestamp(a), parse_timestamp(b)) {
        (Some(a), Some(b)) => (a - b).num_seconds().abs(),
        _ => 0,
    }
}

/// Bracket-quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Exponential backoff calculation
pub fn calculate_backoff_duration(attempt: u32, base_ms: u64, max_ms: u64) -> std::time::Duration {
    let backoff_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    let capped_ms = backoff_ms.min(max_ms);
    std::time::Duration::from_millis(capped_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff_duration(0, 1000, 60000).as_millis(), 1000);
        assert_eq!(calculate_backoff_duration(1, 1000, 60000).as_millis(), 2000);
        assert_eq!(calculate_backoff_duration(2, 1000, 60000).as_millis(), 4000);
        assert_eq!(calculate_backoff_duration(10, 1000, 60000).as_millis(), 60000); // capped
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let now = now_timestamp();
        assert!(parse_timestamp(&now).is_some());
        assert!(parse_timestamp("not a timestamp").is_none());
    }

    #[test]
    fn test_timestamp_drift() {
        assert_eq!(
            timestamp_drift_secs("2024-05-01 12:00:00", "2024-05-01 12:05:30"),
            330
        );
        assert_eq!(timestamp_drift_secs("garbage", "2024-05-01 12:00:00"), 0);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("items"), "[items]");
        assert_eq!(quote_ident("weird]name"), "[weird]]name]");
    }
}
