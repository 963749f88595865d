// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! NAT processing for `ICMPv4` error messages, which quote the headers of the datagram that
//! caused them.
//!
//! The quoted datagram travelled in the opposite direction to the error. It is rewritten so that
//! its headers match what the receiver of the error sent, and the outer header so that the error
//! looks like it answers that datagram.

use crate::conntrack::Connection;
use crate::tuple::{ConnDirection, Endpoint, ManipType};
use etherparse::IpNumber;
use net::buffer::PacketBufferMut;
use net::checksum::{self, Checksum, ChecksumError, ChecksumMut};
use net::icmp4::{Icmp4, icmp_type};
use net::ipv4::Ipv4;
use net::packet::{Packet, PacketError};
use std::net::Ipv4Addr;
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum IcmpErrorMsgError {
    #[error("ICMP type {0} is not an error message")]
    NotAnError(u8),
    #[error("failed to validate ICMP checksum")]
    BadChecksumIcmp(ChecksumError),
    #[error("failed to validate ICMP inner IP checksum")]
    BadChecksumInnerIpv4(ChecksumError),
    #[error("failed to recompute ICMP checksum")]
    Checksum(ChecksumError),
    #[error("quoted datagram too short: {0} transport octets")]
    InnerTooShort(usize),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Translation of `ICMPv4` error messages related to a tracked connection.
pub trait IcmpTranslator<Buf: PacketBufferMut>: Send + Sync {
    /// Translate `packet`, an error message related to `conn` travelling in `dir`, at a hook
    /// manipulating `manip`. Returns true if the packet was modified.
    ///
    /// # Errors
    ///
    /// Any error drops the packet.
    fn translate(
        &self,
        packet: &mut Packet<Buf>,
        conn: &Connection,
        dir: ConnDirection,
        manip: ManipType,
    ) -> Result<bool, IcmpErrorMsgError>;
}

/// Rewrites the quoted datagram from the connection's bindings.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedTranslator;

pub(crate) fn validate_checksums_icmp<Buf: PacketBufferMut>(
    packet: &Packet<Buf>,
) -> Result<(), IcmpErrorMsgError> {
    let icmp = packet.icmp4()?;
    if !icmp.is_error() {
        return Err(IcmpErrorMsgError::NotAnError(icmp.icmp_type()));
    }

    // From REQ-3 from RFC 5508, "NAT Behavioral Requirements for ICMP":
    //
    //    When an ICMP Error packet is received, if the ICMP checksum fails to validate, the NAT
    //    SHOULD silently drop the ICMP Error packet.
    icmp.validate_checksum(&())
        .map_err(IcmpErrorMsgError::BadChecksumIcmp)?;

    // From REQ-3 a) from RFC 5508, "NAT Behavioral Requirements for ICMP":
    //
    //    If the IP checksum of the embedded packet fails to validate, the NAT SHOULD silently
    //    drop the Error packet
    Ipv4::parse(icmp.payload())
        .map_err(PacketError::from)?
        .validate_checksum(&())
        .map_err(IcmpErrorMsgError::BadChecksumInnerIpv4)?;
    Ok(())
}

fn read16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn write16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

/// Fix the transport checksum at `at` of a quoted datagram after a port and an address of its
/// pseudo-header changed. The checksum may lie past the quoted octets, in which case there is
/// nothing to fix.
fn fix_inner_checksum(
    l4: &mut [u8],
    at: usize,
    ports: (u16, u16),
    addrs: (Ipv4Addr, Ipv4Addr),
    zero_means_none: bool,
) {
    if l4.len() < at + 2 {
        return;
    }
    let check = read16(l4, at);
    if zero_means_none && check == 0 {
        return;
    }
    let check = checksum::update16(check, ports.0, ports.1);
    let mut check = checksum::update32(check, addrs.0.to_bits(), addrs.1.to_bits());
    if zero_means_none && check == 0 {
        check = 0xffff;
    }
    write16(l4, at, check);
}

/// Set the `side` endpoint of the datagram quoted in `quoted` to `endpoint`.
fn translate_embedded(
    quoted: &mut [u8],
    endpoint: Endpoint,
    side: ManipType,
) -> Result<(), IcmpErrorMsgError> {
    let (header_len, proto) = {
        let ip = Ipv4::parse(&*quoted).map_err(PacketError::from)?;
        (ip.header_len(), ip.protocol())
    };
    let (header, l4) = quoted.split_at_mut(header_len);
    if l4.len() < 8 {
        return Err(IcmpErrorMsgError::InnerTooShort(l4.len()));
    }

    // From REQ-4 from RFC 5508, "NAT Behavioral Requirements for ICMP":
    //
    //    If the NAT has active mapping for the embedded payload, then the NAT MUST do the
    //    following prior to forwarding the packet, unless explicitly overridden by local
    //    policy:
    //
    //        a) Revert the IP and transport headers of the embedded IP packet to their original
    //        form, using the matching mapping;
    let mut ip = Ipv4::parse(header).map_err(PacketError::from)?;
    let old_addr = match side {
        ManipType::Src => ip.source(),
        ManipType::Dst => ip.destination(),
    };
    if old_addr != endpoint.addr {
        match side {
            ManipType::Src => ip.set_source(endpoint.addr),
            ManipType::Dst => ip.set_destination(endpoint.addr),
        };
    }
    let addrs = (old_addr, endpoint.addr);

    match proto {
        IpNumber::TCP | IpNumber::UDP => {
            let port_at = match side {
                ManipType::Src => 0,
                ManipType::Dst => 2,
            };
            let old_port = read16(l4, port_at);
            write16(l4, port_at, endpoint.port);
            let ports = (old_port, endpoint.port);
            if proto == IpNumber::UDP {
                fix_inner_checksum(l4, 6, ports, addrs, true);
            } else {
                fix_inner_checksum(l4, 16, ports, addrs, false);
            }
        }
        IpNumber::ICMP => {
            let id_side = match l4[0] {
                icmp_type::ECHO_REQUEST => Some(ManipType::Src),
                icmp_type::ECHO_REPLY => Some(ManipType::Dst),
                _ => None,
            };
            if id_side == Some(side) {
                let old_id = read16(l4, 4);
                write16(l4, 4, endpoint.port);
                let check = checksum::update16(read16(l4, 2), old_id, endpoint.port);
                write16(l4, 2, check);
            }
        }
        _ => {}
    }
    Ok(())
}

impl<Buf: PacketBufferMut> IcmpTranslator<Buf> for EmbeddedTranslator {
    fn translate(
        &self,
        packet: &mut Packet<Buf>,
        conn: &Connection,
        dir: ConnDirection,
        manip: ManipType,
    ) -> Result<bool, IcmpErrorMsgError> {
        validate_checksums_icmp(packet)?;

        let bit = match dir {
            ConnDirection::Original => manip,
            ConnDirection::Reply => manip.opposite(),
        };
        if !conn.nat.is_translated(bit) {
            return Ok(false);
        }

        // the quoted datagram went the other way
        let other = conn.tuple(dir.opposite());
        let endpoint = other.endpoint(manip.opposite());

        let (mut ip, l4) = packet.split_mut()?;
        match manip {
            ManipType::Src => ip.set_source(endpoint.addr),
            ManipType::Dst => ip.set_destination(endpoint.addr),
        };
        let mut icmp = Icmp4::parse(l4).map_err(PacketError::from)?;
        translate_embedded(icmp.payload_mut(), endpoint, manip.opposite())?;
        icmp.update_checksum(&())
            .map_err(IcmpErrorMsgError::Checksum)?;
        trace!(
            "connection {}: ICMP error {manip} -> {}, quoted {} -> {endpoint}",
            conn.id(),
            endpoint.addr,
            manip.opposite()
        );
        Ok(true)
    }
}
