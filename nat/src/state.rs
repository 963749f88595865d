// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-connection NAT state, embedded in every tracked connection.

use crate::helper::HelperId;
use crate::seqadj::{SeqEdit, SeqOffset};
use crate::tuple::{ConnDirection, ManipType};
use concurrency::sync::atomic::{AtomicU8, Ordering};
use concurrency::sync::{Mutex, MutexGuard, PoisonError, RwLock};

/// Helper assignment of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperSlot {
    /// No lookup happened yet
    Unresolved,
    /// Looked up, no helper matched
    Unassigned,
    Assigned(HelperId),
}

/// NAT state of a connection.
///
/// * `initialized`: one bit per [`ManipType`], set once the binding for that manipulation has
///   been computed. It is computed at most once, under the setup lock.
/// * `translated`: one bit per [`ManipType`], set when the binding changed the tuple, so
///   packets need rewriting.
#[derive(Debug)]
pub struct NatState {
    setup: Mutex<()>,
    initialized: AtomicU8,
    translated: AtomicU8,
    helper: RwLock<HelperSlot>,
    seq: Mutex<[SeqOffset; 2]>,
}

impl Default for NatState {
    fn default() -> Self {
        Self::new()
    }
}

impl NatState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            setup: Mutex::new(()),
            initialized: AtomicU8::new(0),
            translated: AtomicU8::new(0),
            helper: RwLock::new(HelperSlot::Unresolved),
            seq: Mutex::new([SeqOffset::default(); 2]),
        }
    }

    /// Serializes binding setup for this connection.
    pub(crate) fn lock_setup(&self) -> MutexGuard<'_, ()> {
        self.setup.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_initialized(&self, manip: ManipType) -> bool {
        self.initialized.load(Ordering::Acquire) & manip.bit() != 0
    }

    pub(crate) fn set_initialized(&self, manip: ManipType) {
        self.initialized.fetch_or(manip.bit(), Ordering::AcqRel);
    }

    /// Returns true if the binding of `manip` changed the connection's tuple.
    #[must_use]
    pub fn is_translated(&self, manip: ManipType) -> bool {
        self.translated.load(Ordering::Acquire) & manip.bit() != 0
    }

    pub(crate) fn set_translated(&self, manip: ManipType) {
        self.translated.fetch_or(manip.bit(), Ordering::AcqRel);
    }

    #[must_use]
    pub fn helper_slot(&self) -> HelperSlot {
        *self.helper.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The helper assigned to this connection, if any
    #[must_use]
    pub fn helper(&self) -> Option<HelperId> {
        match self.helper_slot() {
            HelperSlot::Assigned(id) => Some(id),
            HelperSlot::Unresolved | HelperSlot::Unassigned => None,
        }
    }

    pub(crate) fn set_helper(&self, slot: HelperSlot) {
        *self.helper.write().unwrap_or_else(PoisonError::into_inner) = slot;
    }

    /// Sequence records of the direction `dir` and of the opposite direction.
    #[must_use]
    pub fn seq_offsets(&self, dir: ConnDirection) -> (SeqOffset, SeqOffset) {
        let seq = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        (seq[dir.index()], seq[dir.opposite().index()])
    }

    pub(crate) fn record_edit(&self, dir: ConnDirection, seq: u32, delta: i32) -> SeqEdit {
        let mut records = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        records[dir.index()].record_edit(seq, delta)
    }
}
