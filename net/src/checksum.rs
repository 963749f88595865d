// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Internet checksum validation and incremental update.
//!
//! Full checksums are computed by `etherparse` over the header views of this crate, which
//! implement the [`Checksum`] and [`ChecksumMut`] traits. The free functions implement the
//! incremental update of RFC 1624 (`HC' = ~(~HC + ~m + m')`) used when a few fields change.

use std::net::Ipv4Addr;

/// Fold a wide ones-complement sum into 16 bits (end-around carry).
#[must_use]
pub fn fold(mut acc: u64) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    #[allow(clippy::cast_possible_truncation)] // folded above
    let folded = acc as u16;
    folded
}

/// The addresses of the IPv4 pseudo-header covered by TCP and UDP checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PseudoHeader {
    /// source address of the datagram
    pub source: Ipv4Addr,
    /// destination address of the datagram
    pub destination: Ipv4Addr,
}

/// Update `check` after a 16-bit field covered by it changed from `old` to `new`.
#[must_use]
pub fn update16(check: u16, old: u16, new: u16) -> u16 {
    !fold(u64::from(!check) + u64::from(!old) + u64::from(new))
}

/// Update `check` after a 32-bit field covered by it changed from `old` to `new`.
#[must_use]
pub fn update32(check: u16, old: u32, new: u32) -> u16 {
    #[allow(clippy::cast_possible_truncation)] // splitting into halves
    let check = update16(check, (old >> 16) as u16, (new >> 16) as u16);
    #[allow(clippy::cast_possible_truncation)] // splitting into halves
    update16(check, old as u16, new as u16)
}

/// Sum of `data` as 16-bit words, `offset` octets into the checksummed area.
///
/// Octets at an even position are the high half of a word.
fn sum_at(data: &[u8], offset: usize) -> u64 {
    data.iter()
        .enumerate()
        .map(|(i, &octet)| {
            if (offset + i) % 2 == 0 {
                u64::from(octet) << 8
            } else {
                u64::from(octet)
            }
        })
        .sum()
}

/// Update `check` after the octets `old` were replaced by `new` (same length).
///
/// `offset` is the position of the first octet relative to the start of the checksummed area;
/// only its parity matters.
#[must_use]
pub fn update_bytes(check: u16, offset: usize, old: &[u8], new: &[u8]) -> u16 {
    debug_assert_eq!(old.len(), new.len());
    update16(check, fold(sum_at(old, offset)), fold(sum_at(new, offset)))
}

/// A trait for reading and validating the checksum of a header view.
pub trait Checksum {
    /// Extra data, outside of the view, that the checksum covers (e.g. a pseudo-header).
    type Payload: ?Sized;

    /// Get the checksum value from the header
    fn checksum(&self) -> u16;

    /// Compute the checksum value from the header and payload.
    ///
    /// # Errors
    ///
    /// Returns a [`ChecksumError`] if the view cannot be checksummed.
    fn compute_checksum(&self, payload: &Self::Payload) -> Result<u16, ChecksumError>;

    /// Validate the checksum value in the header.
    ///
    /// # Errors
    ///
    /// Returns a [`ChecksumError`] if the checksum is invalid.
    fn validate_checksum(&self, payload: &Self::Payload) -> Result<u16, ChecksumError> {
        let expected = self.compute_checksum(payload)?;
        let actual = self.checksum();
        if expected == actual {
            Ok(expected)
        } else {
            Err(ChecksumError::Mismatch { expected, actual })
        }
    }
}

/// A trait for rewriting the checksum of a mutable header view.
pub trait ChecksumMut: Checksum {
    /// Set the checksum value in the header.
    ///
    /// The validity of the checksum is not checked.
    fn set_checksum(&mut self, checksum: u16) -> &mut Self;

    /// Recompute the checksum over the full header and payload and store it.
    ///
    /// # Errors
    ///
    /// Returns a [`ChecksumError`] if the view cannot be checksummed.
    fn update_checksum(&mut self, payload: &Self::Payload) -> Result<&mut Self, ChecksumError> {
        let checksum = self.compute_checksum(payload)?;
        Ok(self.set_checksum(checksum))
    }
}

/// Errors which may occur when computing or validating a checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChecksumError {
    /// The checksum found in the header is not the one computed over the data
    #[error("checksum mismatch: expected {expected:#06x}, actual {actual:#06x}")]
    Mismatch {
        /// The checksum computed over the data
        expected: u16,
        /// The checksum found in the header
        actual: u16,
    },
    /// The header no longer parses
    #[error("cannot checksum a malformed header")]
    Malformed,
    /// The payload does not fit in the length covered by the checksum
    #[error("payload of {0} octets too long to checksum")]
    TooLong(usize),
}

impl From<etherparse::err::ValueTooBigError<usize>> for ChecksumError {
    fn from(e: etherparse::err::ValueTooBigError<usize>) -> Self {
        ChecksumError::TooLong(e.actual)
    }
}
