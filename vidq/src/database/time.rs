//! Timestamp helpers for the database layer.
//!
//! Timestamps are stored as `INTEGER` Unix epoch milliseconds (UTC).

use chrono::{DateTime, TimeZone, Utc};

/// Current time as Unix epoch milliseconds (UTC).
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a `DateTime<Utc>` to Unix epoch milliseconds.
#[inline]
pub fn datetime_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert Unix epoch milliseconds to `DateTime<Utc>`.
///
/// Out-of-range values clamp instead of panicking.
#[inline]
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => {
            if ms.is_negative() {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            }
        }
    }
}
