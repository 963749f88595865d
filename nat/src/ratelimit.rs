// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rate limiting of log messages on the packet path.

use concurrency::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Allows at most `burst` events per `interval`.
///
/// Lock-free: packet processing on every CPU shares one limiter. Window boundaries are
/// approximate under contention, which is fine for logging.
#[derive(Debug)]
pub struct RateLimiter {
    burst: u32,
    interval_ms: u64,
    start: Instant,
    window_start_ms: AtomicU64,
    count: AtomicU32,
    suppressed: AtomicU64,
}

impl RateLimiter {
    #[must_use]
    pub fn new(burst: u32, interval: Duration) -> Self {
        Self {
            burst,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            start: Instant::now(),
            window_start_ms: AtomicU64::new(0),
            count: AtomicU32::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns true if one more event may be logged now.
    pub fn allow(&self) -> bool {
        let now = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let window = self.window_start_ms.load(Ordering::Acquire);
        if now.saturating_sub(window) >= self.interval_ms
            && self
                .window_start_ms
                .compare_exchange(window, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.count.store(0, Ordering::Release);
            let missed = self.suppressed.swap(0, Ordering::AcqRel);
            if missed > 0 {
                warn!("{missed} messages suppressed");
            }
        }
        if self.count.fetch_add(1, Ordering::AcqRel) < self.burst {
            true
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Number of events refused in the current window
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}
