// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Bindings: what a connection's endpoints are translated to, and how packets are rewritten.

use crate::engine::HookPoint;
use crate::port::NatPort;
use crate::tuple::{Endpoint, ManipType, Tuple};
use etherparse::IpNumber;
use net::buffer::PacketBufferMut;
use net::icmp4::{Icmp4, icmp_type};
use net::packet::{Packet, PacketError};
use net::tcp::Tcp;
use net::udp::Udp;
use std::net::Ipv4Addr;
use tracing::trace;

/// Address and port an endpoint is mapped to.
///
/// Without a port, only the address is translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub addr: Ipv4Addr,
    pub port: Option<NatPort>,
}

impl Mapping {
    #[must_use]
    pub fn new(addr: Ipv4Addr, port: Option<NatPort>) -> Self {
        Self { addr, port }
    }
}

/// A request for the binding of a new connection.
#[derive(Debug, Clone, Copy)]
pub struct BindingRequest {
    /// The connection's original tuple, with the bindings already applied
    pub tuple: Tuple,
    pub hook: HookPoint,
    /// The endpoint to map
    pub manip: ManipType,
    /// For expected connections, the address the master connection uses on this side. The
    /// engine applies it whatever the resolver answers.
    pub master_addr: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("no address or port left to bind {0}")]
    Exhausted(Tuple),
    #[error("binding refused: {0}")]
    Refused(String),
}

/// The policy choosing bindings. It is consulted once per connection and manipulation.
pub trait BindingResolver: Send + Sync {
    /// Returns the mapping for `request.manip`, or `None` to leave that endpoint untranslated.
    ///
    /// # Errors
    ///
    /// Fails when no binding can be allocated; the packet is dropped.
    fn resolve(&self, request: &BindingRequest) -> Result<Option<Mapping>, BindingError>;
}

impl<F> BindingResolver for F
where
    F: Fn(&BindingRequest) -> Result<Option<Mapping>, BindingError> + Send + Sync,
{
    fn resolve(&self, request: &BindingRequest) -> Result<Option<Mapping>, BindingError> {
        self(request)
    }
}

/// Returns true if the transport part of a binding applies to the `manip` side of an original
/// tuple of protocol `proto`.
pub(crate) fn carries_port(proto: IpNumber, manip: ManipType) -> bool {
    match proto {
        IpNumber::TCP | IpNumber::UDP => true,
        // the echo identifier lives on the requester's side
        IpNumber::ICMP => manip == ManipType::Src,
        _ => false,
    }
}

/// Apply `mapping` to the `manip` side of `tuple`.
#[must_use]
pub fn apply_mapping(tuple: &Tuple, manip: ManipType, mapping: &Mapping) -> Tuple {
    let mut endpoint = tuple.endpoint(manip);
    endpoint.addr = mapping.addr;
    if let Some(port) = mapping.port {
        if carries_port(tuple.proto, manip) {
            endpoint.port = port.as_u16();
        }
    }
    tuple.with_endpoint(manip, endpoint)
}

/// Rewrite the `manip` side of the transport header in `l4` to `target`, fixing its checksum for
/// the port change and for the address change from `old_addr`.
fn manip_l4(
    proto: IpNumber,
    l4: &mut [u8],
    target: Endpoint,
    manip: ManipType,
    old_addr: Ipv4Addr,
) -> Result<(), PacketError> {
    match proto {
        IpNumber::TCP => {
            let mut tcp = Tcp::parse(l4)?;
            match manip {
                ManipType::Src => tcp.set_source(target.port),
                ManipType::Dst => tcp.set_destination(target.port),
            };
            tcp.pseudo_header_changed(old_addr, target.addr);
        }
        IpNumber::UDP => {
            let mut udp = Udp::parse(l4)?;
            match manip {
                ManipType::Src => udp.set_source(target.port),
                ManipType::Dst => udp.set_destination(target.port),
            };
            udp.pseudo_header_changed(old_addr, target.addr);
        }
        IpNumber::ICMP => {
            let mut icmp = Icmp4::parse(l4)?;
            let id_side = match icmp.icmp_type() {
                icmp_type::ECHO_REQUEST => Some(ManipType::Src),
                icmp_type::ECHO_REPLY => Some(ManipType::Dst),
                _ => None,
            };
            if id_side == Some(manip) && icmp.identifier() != target.port {
                icmp.set_identifier(target.port);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Rewrite the `manip` side of `packet` (address and port) to the matching endpoint of `target`,
/// the tuple the packet must carry once translated.
///
/// Checksums are updated incrementally. Returns true if the packet changed.
///
/// # Errors
///
/// Fails if the headers are malformed or the buffer cannot be made exclusive.
pub fn manip_packet<Buf: PacketBufferMut>(
    packet: &mut Packet<Buf>,
    target: &Tuple,
    manip: ManipType,
) -> Result<bool, PacketError> {
    let wanted = target.endpoint(manip);
    let (proto, old_addr) = {
        let ip = packet.ipv4()?;
        let addr = match manip {
            ManipType::Src => ip.source(),
            ManipType::Dst => ip.destination(),
        };
        (ip.protocol(), addr)
    };
    let current = current_endpoint(packet, proto, manip, old_addr)?;
    if current == wanted {
        return Ok(false);
    }
    let (mut ip, l4) = packet.split_mut()?;
    manip_l4(proto, l4, wanted, manip, old_addr)?;
    if old_addr != wanted.addr {
        match manip {
            ManipType::Src => ip.set_source(wanted.addr),
            ManipType::Dst => ip.set_destination(wanted.addr),
        };
    }
    trace!("{manip} {old_addr}:{} -> {wanted}", current.port);
    Ok(true)
}

/// The `manip` endpoint of a packet, in tuple form.
fn current_endpoint<Buf: PacketBufferMut>(
    packet: &Packet<Buf>,
    proto: IpNumber,
    manip: ManipType,
    addr: Ipv4Addr,
) -> Result<Endpoint, PacketError> {
    let port = match proto {
        IpNumber::TCP => {
            let tcp = packet.tcp()?;
            match manip {
                ManipType::Src => tcp.source(),
                ManipType::Dst => tcp.destination(),
            }
        }
        IpNumber::UDP => {
            let udp = packet.udp()?;
            match manip {
                ManipType::Src => udp.source(),
                ManipType::Dst => udp.destination(),
            }
        }
        IpNumber::ICMP => {
            let icmp = packet.icmp4()?;
            match (icmp.icmp_type(), manip) {
                (icmp_type::ECHO_REQUEST, ManipType::Src)
                | (icmp_type::ECHO_REPLY, ManipType::Dst) => icmp.identifier(),
                _ => 0,
            }
        }
        _ => 0,
    };
    Ok(Endpoint::new(addr, port))
}
