// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! [`PacketBuffer`] and related traits, and the copy-on-write [`CowBuffer`] handle.

#[cfg(any(doc, test, feature = "test_buffer"))]
pub mod test_buffer;

use core::fmt::Debug;
use std::sync::Arc;

#[allow(unused_imports)] // re-export
#[cfg(any(doc, test, feature = "test_buffer"))]
pub use test_buffer::*;

/// Super trait representing the abstract operations which may be performed on a packet buffer.
pub trait PacketBuffer: AsRef<[u8]> + Debug + 'static {}
impl<T> PacketBuffer for T where T: AsRef<[u8]> + Debug + 'static {}

/// Super trait representing the abstract operations which may be performed on a mutable packet
/// buffer.
pub trait PacketBufferMut:
    PacketBuffer
    + AsMut<[u8]>
    + Append
    + TrimFromEnd
    + Tailroom
    + GrowTailroom
    + TryCloneBuffer
    + Send
    + Sync
{
}
impl<T> PacketBufferMut for T where
    T: PacketBuffer
        + AsMut<[u8]>
        + Append
        + TrimFromEnd
        + Tailroom
        + GrowTailroom
        + TryCloneBuffer
        + Send
        + Sync
{
}

/// Trait representing the ability to get the unused tailroom in a packet buffer.
pub trait Tailroom {
    /// Get the (unused) tailroom in a packet buffer.
    fn tailroom(&self) -> u16;
}

/// Trait representing the ability to append data to a packet buffer.
pub trait Append {
    /// Error which may occur when attempting to append data to the buffer.
    type Error: Debug + Into<BufferError>;
    /// Append data to the buffer if possible.
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if an error occurs while performing this operation.
    /// For example, there may not be enough tailroom available.
    fn append(&mut self, len: u16) -> Result<&mut [u8], Self::Error>;
}

/// Trait representing the ability to trim data from the end of a packet buffer.
pub trait TrimFromEnd {
    /// Error which may occur when attempting to trim data from the end of the buffer.
    type Error: Debug + Into<BufferError>;
    /// Trim data from the end of the buffer if possible.
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if an error occurs while performing this operation.
    /// For example, the buffer may not have `len` bytes in it to begin with.
    fn trim_from_end(&mut self, len: u16) -> Result<&mut [u8], Self::Error>;
}

/// Trait representing the ability to reallocate a packet buffer with more tailroom.
pub trait GrowTailroom {
    /// Error which may occur when the reallocation fails.
    type Error: Debug + Into<BufferError>;
    /// Make sure at least `additional` octets of tailroom are available.
    ///
    /// The contents of the buffer are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if memory could not be allocated.
    fn grow_tailroom(&mut self, additional: u16) -> Result<(), Self::Error>;
}

/// Trait representing the ability to make a deep copy of a packet buffer.
///
/// Unlike [`Clone`], the copy may fail for lack of memory.
pub trait TryCloneBuffer: Sized {
    /// Error which may occur when the copy fails.
    type Error: Debug + Into<BufferError>;
    /// Copy the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if memory could not be allocated.
    fn try_clone(&self) -> Result<Self, Self::Error>;
}

/// Error indicating that there is not enough tailroom in a memory buffer for the requested
/// operation.
#[non_exhaustive]
#[repr(transparent)]
#[derive(Debug, thiserror::Error)]
#[error("Not enough tail room in memory buffer")]
pub struct NotEnoughTailRoom;

/// Error indicating that the buffer is not long enough to perform the requested operation.
#[non_exhaustive]
#[repr(transparent)]
#[derive(Debug, thiserror::Error)]
#[error("MemoryBuffer not long enough to remove required number of bytes")]
pub struct MemoryBufferNotLongEnough;

/// Error indicating that memory for a buffer could not be allocated.
#[non_exhaustive]
#[repr(transparent)]
#[derive(Debug, thiserror::Error)]
#[error("Memory buffer allocation failed")]
pub struct AllocationFailed;

/// Errors raised by buffer operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// See [`NotEnoughTailRoom`]
    #[error(transparent)]
    NotEnoughTailRoom(#[from] NotEnoughTailRoom),
    /// See [`MemoryBufferNotLongEnough`]
    #[error(transparent)]
    NotLongEnough(#[from] MemoryBufferNotLongEnough),
    /// See [`AllocationFailed`]
    #[error(transparent)]
    AllocationFailed(#[from] AllocationFailed),
}

/// A packet buffer which may be shared by several in-flight owners.
///
/// Reading is always possible. Writing goes through [`CowBuffer::make_mut`], which copies the
/// buffer first if anybody else still holds it, so no owner ever sees another owner's writes.
#[derive(Debug)]
pub struct CowBuffer<Buf>(Arc<Buf>);

impl<Buf: PacketBufferMut> CowBuffer<Buf> {
    /// Take ownership of `buf`.
    #[must_use]
    pub fn new(buf: Buf) -> Self {
        Self(Arc::new(buf))
    }

    /// Hand out another reference to the same memory (a clone of the packet, in the
    /// socket-buffer sense).
    #[must_use]
    pub fn share(&self) -> Self {
        Self(Arc::clone(&self.0))
    }

    /// Returns true if another owner holds this buffer.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.0) > 1
    }

    /// Shared access to the buffer.
    #[must_use]
    pub fn get(&self) -> &Buf {
        &self.0
    }

    /// Exclusive access to the buffer, copying it first if it is shared.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::AllocationFailed`] if the copy could not be made. The handle is left
    /// untouched in that case.
    pub fn make_mut(&mut self) -> Result<&mut Buf, BufferError> {
        if Arc::get_mut(&mut self.0).is_none() {
            let copy = self.0.try_clone().map_err(Into::into)?;
            tracing::trace!("copying shared buffer before write");
            self.0 = Arc::new(copy);
        }
        Arc::get_mut(&mut self.0).ok_or(BufferError::AllocationFailed(AllocationFailed))
    }

    /// Take the buffer back, if no other owner holds it.
    ///
    /// # Errors
    ///
    /// Returns the handle unchanged if it is still shared.
    pub fn try_unwrap(self) -> Result<Buf, Self> {
        Arc::try_unwrap(self.0).map_err(Self)
    }
}
