use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    u64::try_from(since_epoch().as_millis()).unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    since_epoch().as_secs()
}

/// Returns true when `expires_unix` is present and no longer in the future.
pub fn is_expired_unix(expires_unix: Option<u64>, now_unix: u64) -> bool {
    expires_unix.is_some_and(|expires| expires <= now_unix)
}
