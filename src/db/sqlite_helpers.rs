//! SQLite helper utilities for type conversion
//!
//! SQLite has no native boolean or timestamp types. Scan state stores
//! timestamps as integer epoch seconds and flags as 0/1 integers.

use chrono::{DateTime, TimeZone, Utc};

// ============================================================================
// Timestamp Helpers (stored as INTEGER epoch seconds)
// ============================================================================

/// Current UTC time as epoch seconds
#[inline]
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Convert epoch seconds to a UTC datetime, clamping unrepresentable values to the epoch
#[inline]
pub fn epoch_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Convert an optional epoch to an optional datetime; zero means "never"
#[inline]
pub fn epoch_to_datetime_opt(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        None
    } else {
        Some(epoch_to_datetime(secs))
    }
}

// ============================================================================
// Boolean Helpers (SQLite uses 0/1 integers)
// ============================================================================

/// Convert bool to SQLite integer (0 or 1)
#[inline]
pub fn bool_to_int(b: bool) -> i32 {
    if b { 1 } else { 0 }
}

/// Convert SQLite integer to bool
#[inline]
pub fn int_to_bool(i: i32) -> bool {
    i != 0
}

// ============================================================================
// Query Building Helpers
// ============================================================================

/// Build a comma-separated list of `?` placeholders for an `IN (...)` clause
pub fn placeholders(count: usize) -> String {
    if count == 0 {
        return "NULL".to_string(); // `IN (NULL)` matches nothing
    }
    vec!["?"; count].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_epoch_conversion() {
        let dt = epoch_to_datetime(1_705_314_645);
        assert_eq!(dt.year(), 2024);
        assert_eq!(dt.month(), 1);
        assert_eq!(dt.day(), 15);
    }

    #[test]
    fn test_zero_epoch_is_never() {
        assert!(epoch_to_datetime_opt(0).is_none());
        assert!(epoch_to_datetime_opt(1).is_some());
    }

    #[test]
    fn test_bool_conversion() {
        assert_eq!(bool_to_int(true), 1);
        assert_eq!(bool_to_int(false), 0);
        assert!(int_to_bool(1));
        assert!(int_to_bool(42)); // Any non-zero is true
        assert!(!int_to_bool(0));
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(3), "?, ?, ?");
        assert_eq!(placeholders(0), "NULL");
    }
}
