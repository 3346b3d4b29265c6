//! Validity interval time helpers.
//!
//! All interval arithmetic runs on timestamps truncated to whole seconds. A
//! missing close bound is treated as positive infinity at the far end of
//! time; inside SQL this is PostgreSQL's `'infinity'` literal, on the Rust
//! side [`MAX_TIMESTAMP`] stands in where a concrete value is needed.

use chrono::{DateTime, Timelike, Utc};

/// Far-future sentinel used where an unbounded close time must be concrete.
// todo: get rid of infinity once the interval arithmetic is range-typed
pub const MAX_TIMESTAMP: &str = "infinity";

/// Truncate a timestamp to whole seconds, matching the SQL-side
/// `date_trunc('second', ...)`.
pub fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn truncation_drops_subsecond_precision() {
        let ts = Utc.with_ymd_and_hms(2021, 6, 1, 12, 30, 45).unwrap()
            + chrono::Duration::microseconds(123456);
        let truncated = truncate_to_seconds(ts);
        assert_eq!(truncated.timestamp_subsec_micros(), 0);
        assert_eq!(
            truncated,
            Utc.with_ymd_and_hms(2021, 6, 1, 12, 30, 45).unwrap()
        );
    }
}
