// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IPv4 header view.

use crate::checksum::{self, Checksum, ChecksumError, ChecksumMut};
use etherparse::err::ipv4::HeaderSliceError;
use etherparse::{IpNumber, Ipv4HeaderSlice};
use std::net::Ipv4Addr;

const TOTAL_LEN: usize = 2;
const FRAG: usize = 6;
const PROTOCOL: usize = 9;
const CHECKSUM: usize = 10;
const SOURCE: usize = 12;
const DESTINATION: usize = 16;

/// A zero-copy view of an IPv4 header at the start of `T`.
///
/// The view may extend past the header (into the payload); only the header octets are accessed.
/// Setters keep the header checksum valid.
#[derive(Debug)]
pub struct Ipv4<T> {
    bytes: T,
}

/// Errors which may occur when viewing bytes as an IPv4 header.
#[derive(Debug, thiserror::Error)]
pub enum Ipv4Error {
    /// The header itself is malformed
    #[error(transparent)]
    Header(#[from] HeaderSliceError),
    /// The total length field does not cover the header
    #[error("total length {total} is smaller than the header length {header}")]
    TotalLengthTooSmall {
        /// the total length field
        total: u16,
        /// the header length
        header: usize,
    },
}

impl<T: AsRef<[u8]>> Ipv4<T> {
    /// The minimum length of an IPv4 header
    pub const MIN_LENGTH: usize = 20;

    /// View `bytes` as an IPv4 header.
    ///
    /// The total length field is only checked against the header length, so a truncated datagram
    /// (as quoted inside an ICMP error) is accepted.
    ///
    /// # Errors
    ///
    /// Returns an [`Ipv4Error`] if the header is malformed.
    pub fn parse(bytes: T) -> Result<Self, Ipv4Error> {
        {
            let header = Ipv4HeaderSlice::from_slice(bytes.as_ref())?;
            let header_len = header.slice().len();
            if usize::from(header.total_len()) < header_len {
                return Err(Ipv4Error::TotalLengthTooSmall {
                    total: header.total_len(),
                    header: header_len,
                });
            }
        }
        Ok(Self { bytes })
    }

    fn read16(&self, at: usize) -> u16 {
        let bytes = self.bytes.as_ref();
        u16::from_be_bytes([bytes[at], bytes[at + 1]])
    }

    fn read_addr(&self, at: usize) -> Ipv4Addr {
        let bytes = self.bytes.as_ref();
        Ipv4Addr::new(bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3])
    }

    /// The header octets
    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.bytes.as_ref()[..self.header_len()]
    }

    /// Length of the header including options
    #[must_use]
    pub fn header_len(&self) -> usize {
        usize::from(self.bytes.as_ref()[0] & 0x0f) * 4
    }

    /// The total length field
    #[must_use]
    pub fn total_len(&self) -> u16 {
        self.read16(TOTAL_LEN)
    }

    /// The protocol carried in the payload
    #[must_use]
    pub fn protocol(&self) -> IpNumber {
        IpNumber(self.bytes.as_ref()[PROTOCOL])
    }

    /// Returns true if the datagram is a fragment other than the first one (no transport header).
    #[must_use]
    pub fn is_later_fragment(&self) -> bool {
        self.read16(FRAG) & 0x1fff != 0
    }

    /// Returns true if the more fragments flag is set: the payload is incomplete.
    #[must_use]
    pub fn more_fragments(&self) -> bool {
        self.read16(FRAG) & 0x2000 != 0
    }

    /// The source address
    #[must_use]
    pub fn source(&self) -> Ipv4Addr {
        self.read_addr(SOURCE)
    }

    /// The destination address
    #[must_use]
    pub fn destination(&self) -> Ipv4Addr {
        self.read_addr(DESTINATION)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Ipv4<T> {
    fn write_addr(&mut self, at: usize, addr: Ipv4Addr) {
        let old = self.read_addr(at);
        let check = checksum::update32(self.checksum(), old.to_bits(), addr.to_bits());
        self.bytes.as_mut()[at..at + 4].copy_from_slice(&addr.octets());
        self.set_checksum(check);
    }

    /// Set the source address, updating the header checksum.
    pub fn set_source(&mut self, addr: Ipv4Addr) -> &mut Self {
        self.write_addr(SOURCE, addr);
        self
    }

    /// Set the destination address, updating the header checksum.
    pub fn set_destination(&mut self, addr: Ipv4Addr) -> &mut Self {
        self.write_addr(DESTINATION, addr);
        self
    }

    /// Set the total length field, updating the header checksum.
    pub fn set_total_len(&mut self, len: u16) -> &mut Self {
        let check = checksum::update16(self.checksum(), self.total_len(), len);
        self.bytes.as_mut()[TOTAL_LEN..TOTAL_LEN + 2].copy_from_slice(&len.to_be_bytes());
        self.set_checksum(check)
    }
}

impl<T: AsRef<[u8]>> Checksum for Ipv4<T> {
    type Payload = ();

    fn checksum(&self) -> u16 {
        self.read16(CHECKSUM)
    }

    fn compute_checksum(&self, _: &()) -> Result<u16, ChecksumError> {
        let header =
            Ipv4HeaderSlice::from_slice(self.header()).map_err(|_| ChecksumError::Malformed)?;
        Ok(header.to_header().calc_header_checksum())
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> ChecksumMut for Ipv4<T> {
    fn set_checksum(&mut self, checksum: u16) -> &mut Self {
        self.bytes.as_mut()[CHECKSUM..CHECKSUM + 2].copy_from_slice(&checksum.to_be_bytes());
        self
    }
}
