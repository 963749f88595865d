// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! `ICMPv4` message view.

use crate::checksum::{self, Checksum, ChecksumError, ChecksumMut};
use etherparse::Icmpv4Type;

const CHECKSUM: usize = 2;
const REST: usize = 4;

/// `ICMPv4` message types this crate distinguishes.
pub mod icmp_type {
    /// Echo reply
    pub const ECHO_REPLY: u8 = 0;
    /// Destination unreachable
    pub const DEST_UNREACHABLE: u8 = 3;
    /// Source quench (deprecated, still an error message)
    pub const SOURCE_QUENCH: u8 = 4;
    /// Redirect
    pub const REDIRECT: u8 = 5;
    /// Echo request
    pub const ECHO_REQUEST: u8 = 8;
    /// Time exceeded
    pub const TIME_EXCEEDED: u8 = 11;
    /// Parameter problem
    pub const PARAMETER_PROBLEM: u8 = 12;
}

/// A zero-copy view of an `ICMPv4` message (header and payload).
#[derive(Debug)]
pub struct Icmp4<T> {
    bytes: T,
}

/// Errors which may occur when viewing bytes as an `ICMPv4` message.
#[derive(Debug, thiserror::Error)]
pub enum Icmp4Error {
    /// Fewer than [`Icmp4::HEADER_LEN`] octets
    #[error("ICMPv4 message truncated: {0} octets")]
    Truncated(usize),
}

impl<T: AsRef<[u8]>> Icmp4<T> {
    /// Length of the fixed part of an `ICMPv4` message
    pub const HEADER_LEN: usize = 8;

    /// View `bytes` as an `ICMPv4` message.
    ///
    /// # Errors
    ///
    /// Returns [`Icmp4Error::Truncated`] if the fixed header is incomplete.
    pub fn parse(bytes: T) -> Result<Self, Icmp4Error> {
        let len = bytes.as_ref().len();
        if len < Self::HEADER_LEN {
            return Err(Icmp4Error::Truncated(len));
        }
        Ok(Self { bytes })
    }

    /// The message type
    #[must_use]
    pub fn icmp_type(&self) -> u8 {
        self.bytes.as_ref()[0]
    }

    /// The message code
    #[must_use]
    pub fn code(&self) -> u8 {
        self.bytes.as_ref()[1]
    }

    /// Returns true for error messages, which quote the offending datagram in their payload.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(
            self.icmp_type(),
            icmp_type::DEST_UNREACHABLE
                | icmp_type::SOURCE_QUENCH
                | icmp_type::REDIRECT
                | icmp_type::TIME_EXCEEDED
                | icmp_type::PARAMETER_PROBLEM
        )
    }

    /// Returns true for echo request and reply messages.
    #[must_use]
    pub fn is_echo(&self) -> bool {
        matches!(
            self.icmp_type(),
            icmp_type::ECHO_REQUEST | icmp_type::ECHO_REPLY
        )
    }

    /// The identifier of an echo message
    #[must_use]
    pub fn identifier(&self) -> u16 {
        let bytes = self.bytes.as_ref();
        u16::from_be_bytes([bytes[REST], bytes[REST + 1]])
    }

    /// The payload (for error messages: the quoted datagram)
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes.as_ref()[Self::HEADER_LEN..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Icmp4<T> {
    /// The payload, mutably. Checksum maintenance is up to the caller.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes.as_mut()[Self::HEADER_LEN..]
    }

    /// Set the identifier of an echo message, updating the checksum.
    pub fn set_identifier(&mut self, id: u16) -> &mut Self {
        let check = checksum::update16(self.checksum(), self.identifier(), id);
        self.bytes.as_mut()[REST..REST + 2].copy_from_slice(&id.to_be_bytes());
        self.set_checksum(check)
    }
}

impl<T: AsRef<[u8]>> Checksum for Icmp4<T> {
    type Payload = ();

    fn checksum(&self) -> u16 {
        let bytes = self.bytes.as_ref();
        u16::from_be_bytes([bytes[CHECKSUM], bytes[CHECKSUM + 1]])
    }

    // the raw form covers octets 4 to 8 whatever the type
    fn compute_checksum(&self, _: &()) -> Result<u16, ChecksumError> {
        let bytes = self.bytes.as_ref();
        let [type_u8, code_u8, _, _, a, b, c, d, ..] = *bytes else {
            return Err(ChecksumError::Malformed);
        };
        let raw = Icmpv4Type::Unknown {
            type_u8,
            code_u8,
            bytes5to8: [a, b, c, d],
        };
        Ok(raw.calc_checksum(&bytes[Self::HEADER_LEN..]))
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> ChecksumMut for Icmp4<T> {
    fn set_checksum(&mut self, checksum: u16) -> &mut Self {
        self.bytes.as_mut()[CHECKSUM..CHECKSUM + 2].copy_from_slice(&checksum.to_be_bytes());
        self
    }
}
