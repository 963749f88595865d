// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Packet struct and methods

pub mod meta;

#[cfg(any(doc, test, feature = "test_buffer"))]
pub mod test_utils;

use crate::buffer::{BufferError, CowBuffer, PacketBufferMut};
use crate::checksum::PseudoHeader;
use crate::icmp4::{Icmp4, Icmp4Error};
use crate::ipv4::{Ipv4, Ipv4Error};
use crate::tcp::{Tcp, TcpError};
use crate::udp::{Udp, UdpError};
use etherparse::IpNumber;
use std::cmp::Ordering;
use tracing::trace;

#[allow(unused_imports)] // re-export
pub use meta::*;

/// An IPv4 datagram in a (possibly shared) packet buffer.
///
/// The buffer always holds exactly one datagram: its length matches the IPv4 total length
/// field. Reads never copy; every write first makes the buffer exclusive (see
/// [`CowBuffer::make_mut`]).
#[derive(Debug)]
pub struct Packet<Buf: PacketBufferMut> {
    data: CowBuffer<Buf>,
    /// packet metadata added by hooks to drive later processing
    pub meta: PacketMeta,
}

/// Errors which may occur when accessing or modifying a [`Packet`]
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The IPv4 header is malformed
    #[error(transparent)]
    Ipv4(#[from] Ipv4Error),
    /// The TCP header is malformed
    #[error(transparent)]
    Tcp(#[from] TcpError),
    /// The UDP header is malformed
    #[error(transparent)]
    Udp(#[from] UdpError),
    /// The `ICMPv4` header is malformed
    #[error(transparent)]
    Icmp4(#[from] Icmp4Error),
    /// The buffer could not be made exclusive or resized
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// The buffer is shorter than the datagram it claims to hold
    #[error("datagram length {total} exceeds buffer length {buffer}")]
    Truncated {
        /// IPv4 total length
        total: usize,
        /// octets in the buffer
        buffer: usize,
    },
    /// The transport header requested does not match the IPv4 protocol field
    #[error("wrong protocol: expected {expected}, found {actual}")]
    WrongProtocol {
        /// protocol number requested
        expected: u8,
        /// protocol number of the datagram
        actual: u8,
    },
    /// A non-initial fragment carries no transport header
    #[error("non-initial fragment has no transport header")]
    Fragment,
    /// A resize would exceed [`Packet::MAX_LEN`]
    #[error("new datagram length {0} exceeds the maximum of 65535")]
    TooLong(usize),
    /// A range lies outside of the transport part of the datagram
    #[error("range {offset}..{end} outside of the datagram payload")]
    OutOfBounds {
        /// start of the range
        offset: usize,
        /// end of the range
        end: usize,
    },
}

/// Error returned when a buffer does not hold a valid datagram; gives the buffer back.
#[derive(Debug, thiserror::Error)]
#[error("invalid packet: {error}")]
pub struct InvalidPacket<Buf: PacketBufferMut> {
    /// the rejected buffer
    pub buf: Buf,
    /// why it was rejected
    #[source]
    pub error: PacketError,
}

impl<Buf: PacketBufferMut> Packet<Buf> {
    /// The largest datagram IPv4 can express
    pub const MAX_LEN: usize = 65535;

    /// Map a `PacketBufferMut` to a `Packet` if the buffer contains a valid IPv4 datagram.
    ///
    /// Octets past the IPv4 total length (link layer padding) are trimmed.
    ///
    /// # Errors
    ///
    /// Returns an [`InvalidPacket`] error if the buffer does not hold an IPv4 datagram.
    pub fn new(mut buf: Buf) -> Result<Packet<Buf>, InvalidPacket<Buf>> {
        let total = match Ipv4::parse(buf.as_ref()).map(|ip| usize::from(ip.total_len())) {
            Ok(total) => total,
            Err(error) => {
                return Err(InvalidPacket {
                    buf,
                    error: error.into(),
                });
            }
        };
        let available = buf.as_ref().len();
        if available < total {
            return Err(InvalidPacket {
                buf,
                error: PacketError::Truncated {
                    total,
                    buffer: available,
                },
            });
        }
        if available > total {
            #[allow(clippy::cast_possible_truncation)] // bounded by buffer length minus total
            let padding = (available - total) as u16;
            if let Err(e) = buf.trim_from_end(padding) {
                return Err(InvalidPacket {
                    buf,
                    error: PacketError::Buffer(e.into()),
                });
            }
        }
        Ok(Packet {
            data: CowBuffer::new(buf),
            meta: PacketMeta::default(),
        })
    }

    /// The datagram octets
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.get().as_ref()
    }

    /// The datagram octets, mutably.
    ///
    /// # Errors
    ///
    /// Fails if the buffer was shared and could not be copied.
    pub fn data_mut(&mut self) -> Result<&mut [u8], PacketError> {
        Ok(self.data.make_mut()?.as_mut())
    }

    /// Length of the datagram
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.data().len()
    }

    /// Length of the IPv4 header
    #[must_use]
    pub fn header_len(&self) -> usize {
        usize::from(self.data()[0] & 0x0f) * 4
    }

    /// Returns true if another in-flight packet shares this buffer.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.data.is_shared()
    }

    /// Another packet referring to the same buffer (with a copy of the metadata).
    #[must_use]
    pub fn share(&self) -> Self {
        Packet {
            data: self.data.share(),
            meta: self.meta.clone(),
        }
    }

    /// View of the IPv4 header
    ///
    /// # Errors
    ///
    /// Fails if the header is malformed.
    pub fn ipv4(&self) -> Result<Ipv4<&[u8]>, PacketError> {
        Ok(Ipv4::parse(self.data())?)
    }

    /// Mutable view of the IPv4 header
    ///
    /// # Errors
    ///
    /// Fails if the header is malformed or the buffer could not be made exclusive.
    pub fn ipv4_mut(&mut self) -> Result<Ipv4<&mut [u8]>, PacketError> {
        Ok(Ipv4::parse(self.data_mut()?)?)
    }

    /// The addresses of the TCP/UDP pseudo-header
    ///
    /// # Errors
    ///
    /// Fails if the header is malformed.
    pub fn pseudo_header(&self) -> Result<PseudoHeader, PacketError> {
        let ip = self.ipv4()?;
        Ok(PseudoHeader {
            source: ip.source(),
            destination: ip.destination(),
        })
    }

    fn check_l4(&self, expected: IpNumber) -> Result<usize, PacketError> {
        let ip = self.ipv4()?;
        if ip.protocol() != expected {
            return Err(PacketError::WrongProtocol {
                expected: expected.0,
                actual: ip.protocol().0,
            });
        }
        if ip.is_later_fragment() {
            return Err(PacketError::Fragment);
        }
        Ok(ip.header_len())
    }

    /// The transport part of the datagram
    #[must_use]
    pub fn l4(&self) -> &[u8] {
        &self.data()[self.header_len()..]
    }

    /// View of the TCP segment
    ///
    /// # Errors
    ///
    /// Fails if the datagram does not carry a valid TCP header.
    pub fn tcp(&self) -> Result<Tcp<&[u8]>, PacketError> {
        let offset = self.check_l4(IpNumber::TCP)?;
        Ok(Tcp::parse(&self.data()[offset..])?)
    }

    /// View of the UDP datagram
    ///
    /// # Errors
    ///
    /// Fails if the datagram does not carry a valid UDP header.
    pub fn udp(&self) -> Result<Udp<&[u8]>, PacketError> {
        let offset = self.check_l4(IpNumber::UDP)?;
        Ok(Udp::parse(&self.data()[offset..])?)
    }

    /// View of the `ICMPv4` message
    ///
    /// # Errors
    ///
    /// Fails if the datagram does not carry a valid `ICMPv4` header.
    pub fn icmp4(&self) -> Result<Icmp4<&[u8]>, PacketError> {
        let offset = self.check_l4(IpNumber::ICMP)?;
        Ok(Icmp4::parse(&self.data()[offset..])?)
    }

    /// Mutable views of the IPv4 header and of the transport part, side by side.
    ///
    /// # Errors
    ///
    /// Fails if the header is malformed or the buffer could not be made exclusive.
    pub fn split_mut(&mut self) -> Result<(Ipv4<&mut [u8]>, &mut [u8]), PacketError> {
        let header_len = self.header_len();
        let (header, l4) = self.data_mut()?.split_at_mut(header_len);
        Ok((Ipv4::parse(header)?, l4))
    }

    /// Mutable view of the TCP segment
    ///
    /// # Errors
    ///
    /// Fails if the datagram does not carry a valid TCP header, or the buffer could not be made
    /// exclusive.
    pub fn tcp_mut(&mut self) -> Result<Tcp<&mut [u8]>, PacketError> {
        let offset = self.check_l4(IpNumber::TCP)?;
        Ok(Tcp::parse(&mut self.data_mut()?[offset..])?)
    }

    /// Mutable view of the UDP datagram
    ///
    /// # Errors
    ///
    /// Fails if the datagram does not carry a valid UDP header, or the buffer could not be made
    /// exclusive.
    pub fn udp_mut(&mut self) -> Result<Udp<&mut [u8]>, PacketError> {
        let offset = self.check_l4(IpNumber::UDP)?;
        Ok(Udp::parse(&mut self.data_mut()?[offset..])?)
    }

    /// Mutable view of the `ICMPv4` message
    ///
    /// # Errors
    ///
    /// Fails if the datagram does not carry a valid `ICMPv4` header, or the buffer could not be
    /// made exclusive.
    pub fn icmp4_mut(&mut self) -> Result<Icmp4<&mut [u8]>, PacketError> {
        let offset = self.check_l4(IpNumber::ICMP)?;
        Ok(Icmp4::parse(&mut self.data_mut()?[offset..])?)
    }

    /// Replace `len` octets at `offset` (from the start of the datagram) with `replacement`,
    /// moving the rest of the datagram and fixing the IPv4 total length and header checksum.
    ///
    /// Transport checksums and length fields are left to the caller.
    ///
    /// # Errors
    ///
    /// * [`PacketError::OutOfBounds`] if the range is not inside the transport part,
    /// * [`PacketError::TooLong`] if the result would exceed [`Packet::MAX_LEN`],
    /// * [`PacketError::Buffer`] if a copy or reallocation failed.
    ///
    /// The packet is unmodified when an error is returned.
    pub fn splice(
        &mut self,
        offset: usize,
        len: usize,
        replacement: &[u8],
    ) -> Result<(), PacketError> {
        let old_len = self.total_len();
        let end = offset + len;
        if offset < self.header_len() || end > old_len {
            return Err(PacketError::OutOfBounds { offset, end });
        }
        let new_len = old_len - len + replacement.len();
        if new_len > Self::MAX_LEN {
            return Err(PacketError::TooLong(new_len));
        }
        let buf = self.data.make_mut()?;
        let moved_to = offset + replacement.len();
        match new_len.cmp(&old_len) {
            Ordering::Greater => {
                #[allow(clippy::cast_possible_truncation)] // new_len <= MAX_LEN
                let grow = (new_len - old_len) as u16;
                buf.grow_tailroom(grow)
                    .map_err(|e| PacketError::Buffer(e.into()))?;
                let data = buf.append(grow).map_err(|e| PacketError::Buffer(e.into()))?;
                data.copy_within(end..old_len, moved_to);
            }
            Ordering::Less => {
                #[allow(clippy::cast_possible_truncation)] // old_len <= MAX_LEN
                let shrink = (old_len - new_len) as u16;
                buf.as_mut().copy_within(end..old_len, moved_to);
                buf.trim_from_end(shrink)
                    .map_err(|e| PacketError::Buffer(e.into()))?;
            }
            Ordering::Equal => {}
        }
        let data = buf.as_mut();
        data[offset..moved_to].copy_from_slice(replacement);
        #[allow(clippy::cast_possible_truncation)] // new_len <= MAX_LEN
        Ipv4::parse(data)?.set_total_len(new_len as u16);
        trace!("spliced {len} octets at {offset} into {}", replacement.len());
        Ok(())
    }

    /// Mark the packet as done, recording why.
    pub fn done(&mut self, reason: DoneReason) {
        self.meta.done = Some(reason);
    }

    /// The reason the packet was marked as done, if it was.
    #[must_use]
    pub fn done_reason(&self) -> Option<DoneReason> {
        self.meta.done
    }
}
