// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Builders for test packets.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]
#![allow(clippy::double_must_use)]

pub use crate::buffer::TestBuffer;
use crate::checksum::{Checksum, PseudoHeader};
use crate::ipv4::Ipv4;
use crate::packet::Packet;
use crate::tcp::Tcp;
use crate::udp::Udp;
use etherparse::{IpNumber, PacketBuilder};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Description of a TCP/IPv4 test segment.
#[derive(Debug, Clone)]
pub struct TcpTemplate {
    /// source address and port
    pub src: SocketAddrV4,
    /// destination address and port
    pub dst: SocketAddrV4,
    /// sequence number
    pub seq: u32,
    /// acknowledgment number, if the ACK bit is set
    pub ack: Option<u32>,
    /// whether the SYN bit is set
    pub syn: bool,
    /// raw options (length must be a multiple of 4)
    pub options: Vec<u8>,
    /// segment payload
    pub payload: Vec<u8>,
}

impl TcpTemplate {
    /// A data-less segment from `src` to `dst` with sequence number 1000 and no flags.
    #[must_use]
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self {
            src,
            dst,
            seq: 1000,
            ack: None,
            syn: false,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Set the sequence number
    #[must_use]
    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    /// Set the ACK bit and acknowledgment number
    #[must_use]
    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Set the SYN bit
    #[must_use]
    pub fn syn(mut self) -> Self {
        self.syn = true;
        self
    }

    /// Set the raw options
    #[must_use]
    pub fn options(mut self, options: &[u8]) -> Self {
        self.options = options.to_vec();
        self
    }

    /// Set the payload
    #[must_use]
    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Serialize the datagram
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        let mut builder = PacketBuilder::ipv4(self.src.ip().octets(), self.dst.ip().octets(), 64)
            .tcp(self.src.port(), self.dst.port(), self.seq, 65535);
        if self.syn {
            builder = builder.syn();
        }
        if let Some(ack) = self.ack {
            builder = builder.ack(ack);
        }
        if !self.options.is_empty() {
            builder = builder.options_raw(&self.options).unwrap();
        }
        let mut out = Vec::new();
        builder.write(&mut out, &self.payload).unwrap();
        out
    }

    /// Build the packet
    #[must_use]
    pub fn packet(&self) -> Packet<TestBuffer> {
        packet_from_bytes(&self.bytes())
    }
}

/// Serialize a UDP/IPv4 datagram
#[must_use]
pub fn udp_bytes(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    PacketBuilder::ipv4(src.ip().octets(), dst.ip().octets(), 64)
        .udp(src.port(), dst.port())
        .write(&mut out, payload)
        .unwrap();
    out
}

/// Serialize an `ICMPv4` echo request
#[must_use]
pub fn icmp_echo_bytes(src: Ipv4Addr, dst: Ipv4Addr, id: u16, seq: u16) -> Vec<u8> {
    let mut out = Vec::new();
    PacketBuilder::ipv4(src.octets(), dst.octets(), 64)
        .icmpv4_echo_request(id, seq)
        .write(&mut out, b"ping")
        .unwrap();
    out
}

/// Serialize an `ICMPv4` error message from `src` to `dst` quoting `quoted`.
///
/// As routers do, only the IP header and the first 8 octets of its payload are quoted.
#[must_use]
pub fn icmp_error_bytes(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    icmp_type: u8,
    code: u8,
    quoted: &[u8],
) -> Vec<u8> {
    let quoted_len = Ipv4::parse(quoted).unwrap().header_len() + 8;
    let mut out = Vec::new();
    PacketBuilder::ipv4(src.octets(), dst.octets(), 64)
        .icmpv4_raw(icmp_type, code, [0; 4])
        .write(&mut out, &quoted[..quoted_len.min(quoted.len())])
        .unwrap();
    out
}

/// Wrap serialized octets into a [`Packet`]
#[must_use]
pub fn packet_from_bytes(bytes: &[u8]) -> Packet<TestBuffer> {
    Packet::new(TestBuffer::from_raw_data(bytes)).unwrap()
}

/// Parse a socket address in `a.b.c.d:port` notation
#[must_use]
pub fn sock(s: &str) -> SocketAddrV4 {
    s.parse().expect("Bad socket address")
}

/// Returns true if the IPv4 header checksum and the transport checksum of `packet` are valid.
#[must_use]
pub fn checksums_valid(packet: &Packet<TestBuffer>) -> bool {
    let ip = packet.ipv4().unwrap();
    if ip.validate_checksum(&()).is_err() {
        return false;
    }
    let pseudo = PseudoHeader {
        source: ip.source(),
        destination: ip.destination(),
    };
    match ip.protocol() {
        IpNumber::TCP => Tcp::parse(packet.l4())
            .unwrap()
            .validate_checksum(&pseudo)
            .is_ok(),
        IpNumber::UDP => {
            let udp = Udp::parse(packet.l4()).unwrap();
            !udp.has_checksum() || udp.validate_checksum(&pseudo).is_ok()
        }
        IpNumber::ICMP => packet.icmp4().unwrap().validate_checksum(&()).is_ok(),
        _ => true,
    }
}
