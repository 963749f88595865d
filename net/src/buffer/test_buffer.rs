// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Toy implementation of [`PacketBuffer`] which is useful for testing.

use crate::buffer::{
    AllocationFailed, Append, GrowTailroom, MemoryBufferNotLongEnough, NotEnoughTailRoom,
    Tailroom, TrimFromEnd, TryCloneBuffer,
};
use tracing::trace;

// only included for doc ref
#[cfg(doc)]
use crate::buffer::PacketBuffer;

// Caution: do not implement Clone for `TestBuffer`.
// Copies must go through `TryCloneBuffer`, which can fail like a real allocator.
/// Toy data structure which implements [`PacketBuffer`]
///
/// The buffer reserves some headroom and tailroom around the packet, like a real network buffer
/// would. It can be told to fail every allocation, which is how the allocation-failure paths of
/// packet mutation get exercised.
#[derive(Debug)]
pub struct TestBuffer {
    buffer: Vec<u8>,
    headroom: u16,
    tailroom: u16,
    fail_alloc: bool,
}

impl Drop for TestBuffer {
    fn drop(&mut self) {
        trace!("Dropping TestBuffer");
    }
}

impl TestBuffer {
    /// The initial capacity of a `TestBuffer`.
    pub const CAPACITY: u16 = 2048;
    /// The reserved headroom of a `TestBuffer`.
    pub const HEADROOM: u16 = 96;
    /// The reserved tailroom of a `TestBuffer`.
    pub const TAILROOM: u16 = 96;

    /// Create a new `TestBuffer` from a given slice of octets
    #[must_use]
    pub fn from_raw_data(data: &[u8]) -> TestBuffer {
        let mut buffer = Vec::with_capacity(TestBuffer::CAPACITY as usize);
        buffer.extend_from_slice(&[0; TestBuffer::HEADROOM as usize]);
        buffer.extend_from_slice(data);
        buffer.extend_from_slice(&[0; TestBuffer::TAILROOM as usize]);
        TestBuffer {
            buffer,
            headroom: TestBuffer::HEADROOM,
            tailroom: TestBuffer::TAILROOM,
            fail_alloc: false,
        }
    }

    /// Make every subsequent allocation (copy or growth) of this buffer fail.
    #[must_use]
    pub fn with_allocation_failure(mut self) -> TestBuffer {
        self.fail_alloc = true;
        self
    }

    /// Get the (unused) headroom of the buffer.
    #[must_use]
    pub fn headroom(&self) -> u16 {
        self.headroom
    }
}

impl AsRef<[u8]> for TestBuffer {
    fn as_ref(&self) -> &[u8] {
        let start = self.headroom as usize;
        let end = self.buffer.len() - self.tailroom as usize;
        &self.buffer.as_slice()[start..end]
    }
}

impl AsMut<[u8]> for TestBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        let start = self.headroom as usize;
        let end = self.buffer.len() - self.tailroom as usize;
        &mut self.buffer.as_mut_slice()[start..end]
    }
}

impl Tailroom for TestBuffer {
    fn tailroom(&self) -> u16 {
        self.tailroom
    }
}

impl Append for TestBuffer {
    type Error = NotEnoughTailRoom;
    fn append(&mut self, len: u16) -> Result<&mut [u8], Self::Error> {
        if self.tailroom < len {
            return Err(NotEnoughTailRoom);
        }
        self.tailroom -= len;
        Ok(self.as_mut())
    }
}

impl TrimFromEnd for TestBuffer {
    type Error = MemoryBufferNotLongEnough;
    fn trim_from_end(&mut self, len: u16) -> Result<&mut [u8], MemoryBufferNotLongEnough> {
        debug_assert!((self.headroom as usize + self.tailroom as usize) <= self.buffer.len());
        if self.as_ref().len() < len as usize {
            return Err(MemoryBufferNotLongEnough);
        }
        self.tailroom += len;
        Ok(self.as_mut())
    }
}

impl GrowTailroom for TestBuffer {
    type Error = AllocationFailed;
    fn grow_tailroom(&mut self, additional: u16) -> Result<(), AllocationFailed> {
        if self.tailroom >= additional {
            return Ok(());
        }
        if self.fail_alloc {
            return Err(AllocationFailed);
        }
        let missing = additional - self.tailroom;
        self.buffer
            .try_reserve_exact(missing as usize)
            .map_err(|_| AllocationFailed)?;
        self.buffer.resize(self.buffer.len() + missing as usize, 0);
        self.tailroom = additional;
        trace!("TestBuffer grown by {missing} octets");
        Ok(())
    }
}

impl TryCloneBuffer for TestBuffer {
    type Error = AllocationFailed;
    fn try_clone(&self) -> Result<TestBuffer, AllocationFailed> {
        if self.fail_alloc {
            return Err(AllocationFailed);
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(self.buffer.len())
            .map_err(|_| AllocationFailed)?;
        buffer.extend_from_slice(&self.buffer);
        Ok(TestBuffer {
            buffer,
            headroom: self.headroom,
            tailroom: self.tailroom,
            fail_alloc: self.fail_alloc,
        })
    }
}
