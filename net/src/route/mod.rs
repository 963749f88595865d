// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Route references attached to locally generated packets.

use crate::packet::meta::InterfaceId;
use std::net::Ipv4Addr;

/// The result of a route lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// interface the packet leaves through
    pub oif: InterfaceId,
    /// next hop, if not directly connected
    pub gateway: Option<Ipv4Addr>,
}

/// The header fields a route lookup is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteKey {
    /// source address of the packet
    pub src: Ipv4Addr,
    /// destination address of the packet
    pub dst: Ipv4Addr,
}

impl RouteKey {
    /// Key a lookup on a source and destination address.
    #[must_use]
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self { src, dst }
    }
}
