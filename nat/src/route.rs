// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Route fixup for locally generated packets.
//!
//! A locally generated packet is routed before it reaches the NAT hook. If the binding changed
//! its addresses, the route it carries may be wrong and is looked up again.

use net::buffer::PacketBufferMut;
use net::packet::{Packet, PacketError};
use net::route::{Route, RouteKey};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

/// The route lookup used by the engine.
///
/// Any closure with the right signature is a router.
pub trait Router: Send + Sync {
    /// The route for packets with the addresses of `key`, if there is one
    fn route(&self, key: &RouteKey) -> Option<Arc<Route>>;
}

impl<F> Router for F
where
    F: Fn(&RouteKey) -> Option<Arc<Route>> + Send + Sync,
{
    fn route(&self, key: &RouteKey) -> Option<Arc<Route>> {
        self(key)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no route from {src} to {dst}")]
    NoRoute { src: Ipv4Addr, dst: Ipv4Addr },
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Look up the route of `packet` from its current addresses and attach it, releasing the
/// previous one.
///
/// # Errors
///
/// Returns [`RouteError::NoRoute`] if the router has no route; the packet keeps its previous
/// route and must be dropped.
pub fn refix_route<Buf: PacketBufferMut>(
    router: &dyn Router,
    packet: &mut Packet<Buf>,
) -> Result<(), RouteError> {
    let key = {
        let ip = packet.ipv4()?;
        RouteKey::new(ip.source(), ip.destination())
    };
    let route = router.route(&key).ok_or(RouteError::NoRoute {
        src: key.src,
        dst: key.dst,
    })?;
    debug!(
        "rerouted {} -> {} through {}",
        key.src, key.dst, route.oif
    );
    packet.meta.oif = Some(route.oif);
    packet.meta.route = Some(route);
    Ok(())
}
