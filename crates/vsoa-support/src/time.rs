use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns `true` once `since.elapsed() >= period`.
#[inline]
pub fn elapsed_since(since: Instant, period: Duration) -> bool {
    since.elapsed() >= period
}
