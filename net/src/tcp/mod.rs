// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! TCP segment view and logic.

use crate::checksum::{self, Checksum, ChecksumError, ChecksumMut, PseudoHeader};
use bitflags::bitflags;
use etherparse::TcpHeaderSlice;
use etherparse::err::tcp::HeaderSliceError;
use std::net::Ipv4Addr;

const SOURCE: usize = 0;
const DESTINATION: usize = 2;
const SEQUENCE: usize = 4;
const ACKNOWLEDGMENT: usize = 8;
const DATA_OFFSET: usize = 12;
const FLAGS: usize = 13;
const CHECKSUM: usize = 16;

bitflags! {
    /// The TCP control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        /// no more data from sender
        const FIN = 0x01;
        /// synchronize sequence numbers
        const SYN = 0x02;
        /// reset the connection
        const RST = 0x04;
        /// push function
        const PSH = 0x08;
        /// acknowledgment field significant
        const ACK = 0x10;
        /// urgent pointer field significant
        const URG = 0x20;
        /// ECN echo
        const ECE = 0x40;
        /// congestion window reduced
        const CWR = 0x80;
    }
}

/// TCP option kinds this crate cares about.
pub mod option_kind {
    /// End of option list
    pub const EOL: u8 = 0;
    /// No-operation (padding)
    pub const NOP: u8 = 1;
    /// Maximum segment size
    pub const MSS: u8 = 2;
    /// SACK permitted (RFC 2018)
    pub const SACK_PERMITTED: u8 = 4;
    /// Length of the SACK permitted option
    pub const SACK_PERMITTED_LEN: u8 = 2;
}

/// A zero-copy view of a TCP segment (header and payload).
#[derive(Debug)]
pub struct Tcp<T> {
    bytes: T,
}

/// Errors which may occur when viewing bytes as a TCP segment.
#[derive(Debug, thiserror::Error)]
pub enum TcpError {
    /// The header is malformed or truncated
    #[error(transparent)]
    Header(#[from] HeaderSliceError),
}

/// Location of one option inside a TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOption {
    /// offset of the kind octet from the start of the segment
    pub offset: usize,
    /// option kind
    pub kind: u8,
    /// total option length (1 for single-octet options)
    pub len: usize,
}

/// Iterator over the options of a TCP header.
///
/// Stops at the end of list option, or at the first malformed option.
#[derive(Debug)]
pub struct TcpOptions<'a> {
    header: &'a [u8],
    pos: usize,
}

impl Iterator for TcpOptions<'_> {
    type Item = TcpOption;

    fn next(&mut self) -> Option<TcpOption> {
        let kind = *self.header.get(self.pos)?;
        let len = match kind {
            option_kind::EOL => return None,
            option_kind::NOP => 1,
            _ => {
                let len = usize::from(*self.header.get(self.pos + 1)?);
                if len < 2 || self.pos + len > self.header.len() {
                    return None;
                }
                len
            }
        };
        let option = TcpOption {
            offset: self.pos,
            kind,
            len,
        };
        self.pos += len;
        Some(option)
    }
}

impl<T: AsRef<[u8]>> Tcp<T> {
    /// The minimum length of a TCP header
    pub const MIN_LENGTH: usize = 20;
    /// The maximum length of a TCP header
    pub const MAX_LENGTH: usize = 60;

    /// View `bytes` as a TCP segment.
    ///
    /// # Errors
    ///
    /// Returns a [`TcpError`] if the header is malformed or truncated.
    pub fn parse(bytes: T) -> Result<Self, TcpError> {
        TcpHeaderSlice::from_slice(bytes.as_ref())?;
        Ok(Self { bytes })
    }

    fn read16(&self, at: usize) -> u16 {
        let bytes = self.bytes.as_ref();
        u16::from_be_bytes([bytes[at], bytes[at + 1]])
    }

    fn read32(&self, at: usize) -> u32 {
        let bytes = self.bytes.as_ref();
        u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    /// The whole segment
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    /// Get the source port
    #[must_use]
    pub fn source(&self) -> u16 {
        self.read16(SOURCE)
    }

    /// Get the destination port
    #[must_use]
    pub fn destination(&self) -> u16 {
        self.read16(DESTINATION)
    }

    /// Get the sequence number
    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.read32(SEQUENCE)
    }

    /// Get the acknowledgment number
    #[must_use]
    pub fn acknowledgment(&self) -> u32 {
        self.read32(ACKNOWLEDGMENT)
    }

    /// Get the header length (including options)
    #[must_use]
    pub fn header_len(&self) -> usize {
        usize::from(self.bytes.as_ref()[DATA_OFFSET] >> 4) * 4
    }

    /// Get the control bits
    #[must_use]
    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_retain(self.bytes.as_ref()[FLAGS])
    }

    /// Returns true for the first segment of a handshake (SYN without ACK).
    #[must_use]
    pub fn is_initial_syn(&self) -> bool {
        let flags = self.flags();
        flags.contains(TcpFlags::SYN) && !flags.contains(TcpFlags::ACK)
    }

    /// Iterate over the options of the header
    #[must_use]
    pub fn options(&self) -> TcpOptions<'_> {
        TcpOptions {
            header: &self.bytes.as_ref()[..self.header_len()],
            pos: Self::MIN_LENGTH,
        }
    }

    /// The segment payload
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes.as_ref()[self.header_len()..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Tcp<T> {
    fn write16(&mut self, at: usize, value: u16) {
        let check = checksum::update16(self.checksum(), self.read16(at), value);
        self.bytes.as_mut()[at..at + 2].copy_from_slice(&value.to_be_bytes());
        self.set_checksum(check);
    }

    fn write32(&mut self, at: usize, value: u32) {
        let check = checksum::update32(self.checksum(), self.read32(at), value);
        self.bytes.as_mut()[at..at + 4].copy_from_slice(&value.to_be_bytes());
        self.set_checksum(check);
    }

    /// The whole segment, mutably. Checksum maintenance is up to the caller.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes.as_mut()
    }

    /// Set the source port, updating the checksum.
    pub fn set_source(&mut self, port: u16) -> &mut Self {
        self.write16(SOURCE, port);
        self
    }

    /// Set the destination port, updating the checksum.
    pub fn set_destination(&mut self, port: u16) -> &mut Self {
        self.write16(DESTINATION, port);
        self
    }

    /// Set the sequence number, updating the checksum.
    pub fn set_sequence(&mut self, seq: u32) -> &mut Self {
        self.write32(SEQUENCE, seq);
        self
    }

    /// Set the acknowledgment number, updating the checksum.
    pub fn set_acknowledgment(&mut self, ack: u32) -> &mut Self {
        self.write32(ACKNOWLEDGMENT, ack);
        self
    }

    /// Replace header octets at `offset` (from the start of the segment), updating the checksum.
    ///
    /// The segment length does not change.
    pub fn overwrite(&mut self, offset: usize, octets: &[u8]) -> &mut Self {
        let end = offset + octets.len();
        let check = checksum::update_bytes(
            self.checksum(),
            offset,
            &self.bytes.as_ref()[offset..end],
            octets,
        );
        self.bytes.as_mut()[offset..end].copy_from_slice(octets);
        self.set_checksum(check)
    }

    /// Fix the checksum after an address of the pseudo-header changed.
    pub fn pseudo_header_changed(&mut self, old: Ipv4Addr, new: Ipv4Addr) -> &mut Self {
        let check = checksum::update32(self.checksum(), old.to_bits(), new.to_bits());
        self.set_checksum(check)
    }
}

impl<T: AsRef<[u8]>> Checksum for Tcp<T> {
    type Payload = PseudoHeader;

    fn checksum(&self) -> u16 {
        self.read16(CHECKSUM)
    }

    fn compute_checksum(&self, pseudo: &PseudoHeader) -> Result<u16, ChecksumError> {
        let header =
            TcpHeaderSlice::from_slice(self.bytes.as_ref()).map_err(|_| ChecksumError::Malformed)?;
        Ok(header.calc_checksum_ipv4_raw(
            pseudo.source.octets(),
            pseudo.destination.octets(),
            self.payload(),
        )?)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> ChecksumMut for Tcp<T> {
    fn set_checksum(&mut self, checksum: u16) -> &mut Self {
        self.bytes.as_mut()[CHECKSUM..CHECKSUM + 2].copy_from_slice(&checksum.to_be_bytes());
        self
    }
}
