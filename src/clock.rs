//! Wall-clock source. Everything time-dependent (backoff, cache TTL, notice
//! throttling) reads time through [`Clock`] so tests can move it by hand.

use std::time::{SystemTime, UNIX_EPOCH};

pub const HOUR_MS: i64 = 60 * 60 * 1000;

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}
