// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Connection tuples, masks and directions.

use etherparse::IpNumber;
use net::buffer::PacketBufferMut;
use net::icmp4::{Icmp4, icmp_type};
use net::ipv4::Ipv4;
use net::packet::{Packet, PacketError};
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;

/// One end of a connection: an address and a port.
///
/// For `ICMPv4` echo flows the port carries the echo identifier on the requester's side, and is
/// zero on the responder's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Which endpoint of a tuple a translation rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManipType {
    Src,
    Dst,
}

impl ManipType {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            ManipType::Src => ManipType::Dst,
            ManipType::Dst => ManipType::Src,
        }
    }

    /// Bit of this manipulation in per-connection bitmaps
    #[must_use]
    pub(crate) fn bit(self) -> u8 {
        match self {
            ManipType::Src => 1 << 0,
            ManipType::Dst => 1 << 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ManipType::Src => "src",
            ManipType::Dst => "dst",
        }
    }
}

impl Display for ManipType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a packet relative to the connection it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnDirection {
    /// Same direction as the packet which created the connection
    Original,
    Reply,
}

impl ConnDirection {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            ConnDirection::Original => ConnDirection::Reply,
            ConnDirection::Reply => ConnDirection::Original,
        }
    }

    /// Index of per-direction state
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            ConnDirection::Original => 0,
            ConnDirection::Reply => 1,
        }
    }
}

impl Display for ConnDirection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnDirection::Original => f.write_str("original"),
            ConnDirection::Reply => f.write_str("reply"),
        }
    }
}

/// A connection five-tuple, as seen in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple {
    pub proto: IpNumber,
    pub src: Endpoint,
    pub dst: Endpoint,
}

impl Tuple {
    #[must_use]
    pub fn new(proto: IpNumber, src: Endpoint, dst: Endpoint) -> Self {
        Self { proto, src, dst }
    }

    /// The tuple of a packet travelling the other way
    #[must_use]
    pub fn invert(&self) -> Self {
        Self {
            proto: self.proto,
            src: self.dst,
            dst: self.src,
        }
    }

    #[must_use]
    pub fn endpoint(&self, manip: ManipType) -> Endpoint {
        match manip {
            ManipType::Src => self.src,
            ManipType::Dst => self.dst,
        }
    }

    /// A copy of this tuple with the endpoint selected by `manip` replaced.
    #[must_use]
    pub fn with_endpoint(&self, manip: ManipType, endpoint: Endpoint) -> Self {
        let mut tuple = *self;
        match manip {
            ManipType::Src => tuple.src = endpoint,
            ManipType::Dst => tuple.dst = endpoint,
        }
        tuple
    }

    /// Returns true if `self` and `pattern` are equal on every bit set in `mask`.
    #[must_use]
    pub fn masked_eq(&self, pattern: &Tuple, mask: &TupleMask) -> bool {
        (self.proto.0 ^ pattern.proto.0) & mask.proto == 0
            && mask.src.matches(&self.src, &pattern.src)
            && mask.dst.matches(&self.dst, &pattern.dst)
    }
}

impl Display for Tuple {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let proto = match self.proto {
            IpNumber::TCP => "TCP",
            IpNumber::UDP => "UDP",
            IpNumber::ICMP => "ICMP",
            _ => "Other",
        };
        write!(f, "[{proto}] {} -> {}", self.src, self.dst)
    }
}

/// Significant bits of one endpoint in a [`TupleMask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointMask {
    pub addr: u32,
    pub port: u16,
}

impl EndpointMask {
    pub const ANY: EndpointMask = EndpointMask { addr: 0, port: 0 };
    pub const EXACT: EndpointMask = EndpointMask {
        addr: u32::MAX,
        port: u16::MAX,
    };

    fn matches(&self, a: &Endpoint, b: &Endpoint) -> bool {
        (a.addr.to_bits() ^ b.addr.to_bits()) & self.addr == 0 && (a.port ^ b.port) & self.port == 0
    }

    fn intersect(&self, other: &EndpointMask) -> EndpointMask {
        EndpointMask {
            addr: self.addr & other.addr,
            port: self.port & other.port,
        }
    }
}

/// Significant bits of a [`Tuple`] when matching it against a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TupleMask {
    pub proto: u8,
    pub src: EndpointMask,
    pub dst: EndpointMask,
}

impl TupleMask {
    /// Every bit is significant
    pub const EXACT: TupleMask = TupleMask {
        proto: u8::MAX,
        src: EndpointMask::EXACT,
        dst: EndpointMask::EXACT,
    };

    /// Only the protocol and the destination port are significant, which is how helpers for
    /// well-known services are usually registered.
    #[must_use]
    pub fn proto_dst_port() -> Self {
        TupleMask {
            proto: u8::MAX,
            src: EndpointMask::ANY,
            dst: EndpointMask {
                addr: 0,
                port: u16::MAX,
            },
        }
    }

    /// Everything but the source port is significant, which is how data channels announced by
    /// a control connection are usually expected.
    #[must_use]
    pub fn any_src_port() -> Self {
        TupleMask {
            proto: u8::MAX,
            src: EndpointMask {
                addr: u32::MAX,
                port: 0,
            },
            dst: EndpointMask::EXACT,
        }
    }

    /// Bits significant in both masks
    #[must_use]
    pub fn intersect(&self, other: &TupleMask) -> TupleMask {
        TupleMask {
            proto: self.proto & other.proto,
            src: self.src.intersect(&other.src),
            dst: self.dst.intersect(&other.dst),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TupleError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("protocol {0} cannot be tracked")]
    UnsupportedProtocol(u8),
    #[error("ICMP type {0} cannot be tracked")]
    UnsupportedIcmp(u8),
    #[error("quoted datagram too short to identify a connection: {0} octets")]
    QuotedTooShort(usize),
    #[error("non-initial fragment")]
    Fragment,
}

/// What connection tracking needs to know about a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketKey {
    /// The packet's own tuple
    pub tuple: Tuple,
    /// TCP segment with SYN set and ACK clear
    pub initial_syn: bool,
    /// For `ICMPv4` error messages, the tuple of the quoted datagram
    pub icmp_error: Option<Tuple>,
}

fn echo_tuple(src: Ipv4Addr, dst: Ipv4Addr, kind: u8, id: u16) -> Tuple {
    let (src_port, dst_port) = if kind == icmp_type::ECHO_REQUEST {
        (id, 0)
    } else {
        (0, id)
    };
    Tuple::new(
        IpNumber::ICMP,
        Endpoint::new(src, src_port),
        Endpoint::new(dst, dst_port),
    )
}

/// Tuple of the datagram quoted by an `ICMPv4` error message.
///
/// Only the IPv4 header and the first eight octets of its payload are needed (and guaranteed to
/// be present).
pub(crate) fn quoted_tuple(quoted: &[u8]) -> Result<Tuple, TupleError> {
    let ip = Ipv4::parse(quoted).map_err(PacketError::from)?;
    let (src, dst) = (ip.source(), ip.destination());
    let l4 = &quoted[ip.header_len()..];
    if l4.len() < 8 {
        return Err(TupleError::QuotedTooShort(l4.len()));
    }
    let port = |at: usize| u16::from_be_bytes([l4[at], l4[at + 1]]);
    match ip.protocol() {
        IpNumber::TCP | IpNumber::UDP => Ok(Tuple::new(
            ip.protocol(),
            Endpoint::new(src, port(0)),
            Endpoint::new(dst, port(2)),
        )),
        IpNumber::ICMP => match l4[0] {
            kind @ (icmp_type::ECHO_REQUEST | icmp_type::ECHO_REPLY) => {
                Ok(echo_tuple(src, dst, kind, port(4)))
            }
            kind => Err(TupleError::UnsupportedIcmp(kind)),
        },
        other => Err(TupleError::UnsupportedProtocol(other.0)),
    }
}

impl PacketKey {
    /// Extract the tracking key of an IPv4 datagram.
    ///
    /// # Errors
    ///
    /// Fails for malformed packets, non-initial fragments and protocols that cannot be tracked
    /// (anything but TCP, UDP, `ICMPv4` echo and `ICMPv4` errors quoting such datagrams).
    pub fn from_packet<Buf: PacketBufferMut>(packet: &Packet<Buf>) -> Result<Self, TupleError> {
        let ip = packet.ipv4()?;
        if ip.is_later_fragment() {
            return Err(TupleError::Fragment);
        }
        let (src, dst) = (ip.source(), ip.destination());
        match ip.protocol() {
            IpNumber::TCP => {
                let tcp = packet.tcp()?;
                Ok(PacketKey {
                    tuple: Tuple::new(
                        IpNumber::TCP,
                        Endpoint::new(src, tcp.source()),
                        Endpoint::new(dst, tcp.destination()),
                    ),
                    initial_syn: tcp.is_initial_syn(),
                    icmp_error: None,
                })
            }
            IpNumber::UDP => {
                let udp = packet.udp()?;
                Ok(PacketKey {
                    tuple: Tuple::new(
                        IpNumber::UDP,
                        Endpoint::new(src, udp.source()),
                        Endpoint::new(dst, udp.destination()),
                    ),
                    initial_syn: false,
                    icmp_error: None,
                })
            }
            IpNumber::ICMP => {
                let icmp: Icmp4<&[u8]> = packet.icmp4()?;
                if icmp.is_echo() {
                    return Ok(PacketKey {
                        tuple: echo_tuple(src, dst, icmp.icmp_type(), icmp.identifier()),
                        initial_syn: false,
                        icmp_error: None,
                    });
                }
                if !icmp.is_error() {
                    return Err(TupleError::UnsupportedIcmp(icmp.icmp_type()));
                }
                Ok(PacketKey {
                    tuple: Tuple::new(IpNumber::ICMP, Endpoint::new(src, 0), Endpoint::new(dst, 0)),
                    initial_syn: false,
                    icmp_error: Some(quoted_tuple(icmp.payload())?),
                })
            }
            other => Err(TupleError::UnsupportedProtocol(other.0)),
        }
    }
}
