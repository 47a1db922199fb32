use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// return minisecond
pub(crate) fn get_now_as_u128() -> u128 {
    let now = SystemTime::now();
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    since_epoch.as_millis()
}

/// Elapsed milliseconds as f64, for histogram observations.
pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub(crate) fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
