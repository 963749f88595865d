// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![allow(missing_docs)] // fields and variants are described inline

use crate::route::Route;
use std::any::Any;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Identifier of a network interface.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceId(u32);

impl InterfaceId {
    /// Wrap a raw interface index
    #[must_use]
    pub fn new(val: u32) -> Self {
        Self(val)
    }
    /// The raw interface index
    #[must_use]
    pub fn get_id(&self) -> u32 {
        self.0
    }
}

impl Display for InterfaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// Why a packet stopped being processed.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum DoneReason {
    InternalFailure,   /* catch-all for internal issues */
    Malformed,         /* the packet does not conform / is malformed */
    Untracked,         /* connection tracking could not classify the packet */
    NatOutOfResources, /* can't do NAT due to lack of resources */
    NatConflict,       /* the translated tuple is already in use */
    NatFailure,        /* translation could not be applied */
    HelperFailure,     /* an application helper rejected the packet */
    TooLong,           /* a payload rewrite would exceed the maximum datagram size */
    RouteFailure,      /* missing routing information */
    Unhandled,         /* there exists no support to handle this type of packet */
    Delivered,         /* the packet was consumed by the NAT engine */
}

impl DoneReason {
    /// Short name, used as a metric label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DoneReason::InternalFailure => "internal_failure",
            DoneReason::Malformed => "malformed",
            DoneReason::Untracked => "untracked",
            DoneReason::NatOutOfResources => "nat_out_of_resources",
            DoneReason::NatConflict => "nat_conflict",
            DoneReason::NatFailure => "nat_failure",
            DoneReason::HelperFailure => "helper_failure",
            DoneReason::TooLong => "too_long",
            DoneReason::RouteFailure => "route_failure",
            DoneReason::Unhandled => "unhandled",
            DoneReason::Delivered => "delivered",
        }
    }
}

impl Display for DoneReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata travelling with a packet through the hooks.
#[derive(Debug, Default, Clone)]
pub struct PacketMeta {
    pub iif: Option<InterfaceId>, /* incoming interface */
    pub oif: Option<InterfaceId>, /* outgoing interface */
    pub route: Option<Arc<Route>>, /* route attached by the local output path */
    pub done: Option<DoneReason>, /* if Some, the reason why a packet was marked as done */
    pub conntrack: Option<Arc<dyn Any + Send + Sync>>, /* connection state attached at the first hook */
}
