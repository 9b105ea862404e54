use chrono::{DateTime, TimeZone, Utc};

/// Nanosecond mtime as reported by `MetadataExt`, as a UTC timestamp.
pub fn mtime_ns_to_utc(mtime_ns: i128) -> DateTime<Utc> {
    let secs = (mtime_ns.div_euclid(1_000_000_000)) as i64;
    let nanos = mtime_ns.rem_euclid(1_000_000_000) as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_default()
}
