// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! UDP datagram view and logic.

use crate::checksum::{self, Checksum, ChecksumError, ChecksumMut, PseudoHeader};
use etherparse::UdpHeaderSlice;
use etherparse::err::LenError;
use std::net::Ipv4Addr;

const SOURCE: usize = 0;
const DESTINATION: usize = 2;
const LENGTH: usize = 4;
const CHECKSUM: usize = 6;

/// A zero-copy view of a UDP datagram (header and payload).
///
/// A checksum field of zero means that the sender did not compute a checksum; setters leave it
/// that way.
#[derive(Debug)]
pub struct Udp<T> {
    bytes: T,
}

/// Errors which may occur when viewing bytes as a UDP datagram.
#[derive(Debug, thiserror::Error)]
pub enum UdpError {
    /// The header is truncated
    #[error(transparent)]
    Length(#[from] LenError),
}

impl<T: AsRef<[u8]>> Udp<T> {
    /// The length of a UDP header
    pub const HEADER_LEN: usize = 8;

    /// View `bytes` as a UDP datagram.
    ///
    /// # Errors
    ///
    /// Returns a [`UdpError`] if the header is truncated.
    pub fn parse(bytes: T) -> Result<Self, UdpError> {
        UdpHeaderSlice::from_slice(bytes.as_ref())?;
        Ok(Self { bytes })
    }

    fn read16(&self, at: usize) -> u16 {
        let bytes = self.bytes.as_ref();
        u16::from_be_bytes([bytes[at], bytes[at + 1]])
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

    /// The length field (header included)
    #[must_use]
    pub fn length(&self) -> u16 {
        self.read16(LENGTH)
    }

    /// Returns true if the sender computed a checksum
    #[must_use]
    pub fn has_checksum(&self) -> bool {
        self.checksum() != 0
    }

    /// The datagram payload
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes.as_ref()[Self::HEADER_LEN..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Udp<T> {
    // a transmitted checksum is never zero
    fn store_updated(&mut self, check: u16) {
        self.set_checksum(if check == 0 { 0xffff } else { check });
    }

    fn write16(&mut self, at: usize, value: u16) {
        if self.has_checksum() {
            let check = checksum::update16(self.checksum(), self.read16(at), value);
            self.store_updated(check);
        }
        self.bytes.as_mut()[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// The whole datagram, mutably. Checksum maintenance is up to the caller.
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

    /// Set the length field, updating the checksum.
    ///
    /// The length appears twice in the checksum (header and pseudo-header).
    pub fn set_length(&mut self, len: u16) -> &mut Self {
        let old = self.length();
        self.write16(LENGTH, len);
        if self.has_checksum() {
            let check = checksum::update16(self.checksum(), old, len);
            self.store_updated(check);
        }
        self
    }

    /// Fix the checksum after an address of the pseudo-header changed.
    pub fn pseudo_header_changed(&mut self, old: Ipv4Addr, new: Ipv4Addr) -> &mut Self {
        if self.has_checksum() {
            let check = checksum::update32(self.checksum(), old.to_bits(), new.to_bits());
            self.store_updated(check);
        }
        self
    }
}

impl<T: AsRef<[u8]>> Checksum for Udp<T> {
    type Payload = PseudoHeader;

    fn checksum(&self) -> u16 {
        self.read16(CHECKSUM)
    }

    /// Computes the checksum, a computed zero is sent as `0xffff` (zero means "no checksum").
    fn compute_checksum(&self, pseudo: &PseudoHeader) -> Result<u16, ChecksumError> {
        let header =
            UdpHeaderSlice::from_slice(self.bytes.as_ref()).map_err(|_| ChecksumError::Malformed)?;
        Ok(header.to_header().calc_checksum_ipv4_raw(
            pseudo.source.octets(),
            pseudo.destination.octets(),
            self.payload(),
        )?)
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> ChecksumMut for Udp<T> {
    fn set_checksum(&mut self, checksum: u16) -> &mut Self {
        self.bytes.as_mut()[CHECKSUM..CHECKSUM + 2].copy_from_slice(&checksum.to_be_bytes());
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in tests
mod tests {
    use super::Udp;
    use crate::checksum::{Checksum, ChecksumMut, PseudoHeader};
    use etherparse::PacketBuilder;
    use std::net::Ipv4Addr;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 7);

    fn datagram(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        PacketBuilder::ipv4(SRC.octets(), DST.octets(), 64)
            .udp(5060, 5060)
            .write(&mut out, payload)
            .unwrap();
        out.split_off(20)
    }

    fn pseudo() -> PseudoHeader {
        PseudoHeader {
            source: SRC,
            destination: DST,
        }
    }

    #[test]
    fn setters_keep_checksum_valid() {
        let mut bytes = datagram(b"INVITE");
        let mut udp = Udp::parse(bytes.as_mut_slice()).unwrap();
        assert!(udp.has_checksum());
        udp.validate_checksum(&pseudo()).unwrap();
        udp.set_source(1024).set_destination(9);
        udp.validate_checksum(&pseudo()).unwrap();
        assert_eq!(udp.payload(), b"INVITE");
    }

    #[test]
    fn missing_checksum_stays_missing() {
        let mut bytes = datagram(b"x");
        let mut udp = Udp::parse(bytes.as_mut_slice()).unwrap();
        udp.set_checksum(0);
        assert!(!udp.has_checksum());
        udp.set_source(1).pseudo_header_changed(SRC, DST);
        assert_eq!(udp.checksum(), 0);
    }

    #[test]
    fn truncated_header() {
        assert!(Udp::parse(&[0u8; 7][..]).is_err());
    }
}
