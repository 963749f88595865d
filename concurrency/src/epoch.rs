// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Epoch-based quiescence barrier.
//!
//! Readers (packet processing) call [`EpochDomain::enter`] and hold the returned [`EpochGuard`]
//! for as long as they may use pointers obtained from shared tables. A writer that removed an
//! object from such a table calls [`EpochDomain::synchronize`]: once it returns, every reader
//! that could have observed the object before its removal has left, and the object can be
//! reclaimed or torn down.
//!
//! Readers never block. They increment the counter of the epoch parity they observed and then
//! re-check the epoch; if a writer moved it in between, they retry on the new parity. A writer
//! bumps the epoch and only has to wait for the counter of the previous parity to drain.

use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::sync::{Mutex, PoisonError};
use crate::thread;
use std::fmt::{Debug, Formatter};
use tracing::trace;

/// A domain of readers and writers sharing one epoch counter.
pub struct EpochDomain {
    epoch: AtomicU64,
    active: [AtomicUsize; 2],
    writer: Mutex<()>,
}

impl Debug for EpochDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochDomain")
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field("active_even", &self.active[0].load(Ordering::Relaxed))
            .field("active_odd", &self.active[1].load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for EpochDomain {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that the holder is inside a read-side critical section of an [`EpochDomain`].
///
/// Dropping the guard leaves the critical section.
#[must_use = "dropping the guard immediately leaves the critical section"]
pub struct EpochGuard<'a> {
    domain: &'a EpochDomain,
    epoch: u64,
}

impl EpochGuard<'_> {
    /// The epoch observed when the guard was taken.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Debug for EpochGuard<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EpochGuard({})", self.epoch)
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.domain.active[slot(self.epoch)].fetch_sub(1, Ordering::SeqCst);
    }
}

#[allow(clippy::cast_possible_truncation)] // masked to a single bit
fn slot(epoch: u64) -> usize {
    (epoch & 1) as usize
}

impl EpochDomain {
    /// Create a new domain, starting at epoch zero with no readers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            active: [AtomicUsize::new(0), AtomicUsize::new(0)],
            writer: Mutex::new(()),
        }
    }

    /// The current epoch.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Enter a read-side critical section.
    ///
    /// This never blocks: it only retries if a writer advanced the epoch while we were stamping
    /// ourselves in.
    pub fn enter(&self) -> EpochGuard<'_> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let counter = &self.active[slot(epoch)];
            counter.fetch_add(1, Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return EpochGuard {
                    domain: self,
                    epoch,
                };
            }
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Advance the epoch and wait until every reader that entered before the call has left.
    ///
    /// Writers are serialized. Must not be called while holding an [`EpochGuard`] of the same
    /// domain, as the call would wait for itself.
    ///
    /// Returns the new epoch.
    pub fn synchronize(&self) -> u64 {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.epoch.fetch_add(1, Ordering::SeqCst);
        let counter = &self.active[slot(previous)];
        while counter.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
        trace!("epoch {previous} drained, now at {}", previous + 1);
        previous + 1
    }
}

#[cfg(all(test, not(any(feature = "loom", feature = "shuttle"))))]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in tests
mod tests {
    use super::EpochDomain;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_synchronize_without_readers() {
        let domain = EpochDomain::new();
        assert_eq!(domain.current(), 0);
        assert_eq!(domain.synchronize(), 1);
        assert_eq!(domain.synchronize(), 2);
        assert_eq!(domain.current(), 2);
    }

    #[test]
    fn test_guard_stamps_epoch() {
        let domain = EpochDomain::new();
        {
            let guard = domain.enter();
            assert_eq!(guard.epoch(), 0);
        }
        domain.synchronize();
        let guard = domain.enter();
        assert_eq!(guard.epoch(), 1);
    }

    #[test]
    fn test_synchronize_waits_for_reader() {
        let domain = Arc::new(EpochDomain::new());
        let done = Arc::new(AtomicBool::new(false));

        let guard = domain.enter();
        let handle = {
            let domain = domain.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                domain.synchronize();
                done.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        drop(guard);
        handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_nested_guards_release_on_drop() {
        let domain = EpochDomain::new();
        let outer = domain.enter();
        let inner = domain.enter();
        assert_eq!(outer.epoch(), inner.epoch());
        drop(inner);
        drop(outer);
        let dbg = format!("{domain:?}");
        assert!(dbg.contains("active_even: 0"), "{dbg}");
        assert_eq!(domain.synchronize(), 1);
    }
}
