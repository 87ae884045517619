//! Unix-second timestamps.
//!
//! Times are stored as BIGINT seconds so every engine uses the same column type.

use chrono::{DateTime, TimeZone, Utc};

/// Current time in unix seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Convert stored unix seconds to a UTC timestamp.
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
