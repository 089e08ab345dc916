//! Bounded retries with exponential backoff and jitter.
//!
//! Used for every call that leaves the process: storage backends and
//! geocoding providers. The caller decides which errors are worth another
//! attempt; everything else is returned immediately.

use std::hash::{BuildHasher, RandomState};
use std::time::Duration;
use tracing::debug;

/// Backoff schedule: `base * 2^attempt`, capped at `max`, plus up to
/// `base` of random jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(8),
            max_retries: 3,
        }
    }
}

impl Backoff {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// No waiting between attempts. Tests use this.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            max_retries,
        }
    }

    /// Delay before retry number `attempt` (0-based), jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp = self.base.saturating_mul(factor).min(self.max);
        exp + jitter(self.base)
    }
}

/// Uniform-ish random duration in `[0, max)`.
///
/// `RandomState` is seeded per instance, so hashing a constant through a
/// fresh one yields a new random value each call.
pub fn jitter(max: Duration) -> Duration {
    let nanos = max.as_nanos() as u64;
    if nanos == 0 {
        return Duration::ZERO;
    }
    let random = RandomState::new().hash_one(0u8);
    Duration::from_nanos(random % nanos)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. `op` receives the 0-based attempt number.
pub fn retry<T, E, F, R>(policy: &Backoff, is_retryable: R, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && is_retryable(&e) => {
                let delay = policy.delay(attempt);
                debug!(attempt, ?delay, error = %e, "retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
