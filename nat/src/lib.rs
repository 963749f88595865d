// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(rustdoc::all)]

//! Stateful Network Address Translation (NAT) with application level gateway helpers.
//!
//! [`NatEngine`] is called at three hook points of the forwarding path. For each connection it
//! asks a [`BindingResolver`] once per manipulation (source, destination) which endpoint to map
//! to, rewrites headers accordingly, and hands packets to the [`NatHelper`] registered for the
//! connection, if any. Helpers rewrite payloads through [`HelperContext`], which keeps the TCP
//! sequence space coherent across length-changing edits, and expect related connections whose
//! bindings then follow the master connection's.
//!
//! # Example
//!
//! ```
//! # use net::buffer::TestBuffer;
//! # use net::packet::test_utils::{TcpTemplate, sock};
//! # use net::route::{Route, RouteKey};
//! # use std::sync::Arc;
//! use natalg_nat::{
//!     BindingError, BindingRequest, ConnTable, HookPoint, ManipType, Mapping, NatConfig,
//!     NatEngine, NatPort, Verdict,
//! };
//!
//! fn masquerade(req: &BindingRequest) -> Result<Option<Mapping>, BindingError> {
//!     let port = NatPort::new_port_checked(40000).ok();
//!     Ok((req.manip == ManipType::Src).then(|| Mapping::new([203, 0, 113, 1].into(), port)))
//! }
//!
//! fn no_route(_: &RouteKey) -> Option<Arc<Route>> {
//!     None
//! }
//!
//! let config = NatConfig::default();
//! let table = Arc::new(ConnTable::new(config.expect_timeout));
//! let engine: NatEngine<TestBuffer> = NatEngine::new(config, table, masquerade, no_route)
//!     .expect("valid configuration");
//!
//! let mut packet = TcpTemplate::new(sock("10.0.0.1:1234"), sock("192.0.2.1:80"))
//!     .syn()
//!     .packet();
//! assert_eq!(engine.hook(HookPoint::PostRouting, &mut packet, None, None), Verdict::Accept);
//! assert_eq!(packet.tcp().unwrap().source(), 40000);
//! ```
//!
//! # Limitations
//!
//! - Only IPv4 is supported; tracked protocols are TCP, UDP and `ICMPv4` echo, plus `ICMPv4`
//!   errors quoting them
//! - One sequence correction window per connection direction: a length-changing edit behind the
//!   latest one is not accounted for
//! - [`ConnTable`] does not collect garbage; connections live until torn down

pub mod binding;
pub mod config;
pub mod conntrack;
pub mod engine;
pub mod expect;
pub mod helper;
pub mod icmp_error_msg;
pub mod mangle;
pub mod port;
pub mod ratelimit;
pub mod route;
pub mod sack;
pub mod seqadj;
pub mod state;
pub mod stats;
mod test;
pub mod tuple;

pub use binding::{BindingError, BindingRequest, BindingResolver, Mapping};
pub use config::{ConfigError, NatConfig};
pub use conntrack::{ConnTable, ConnTracker, Connection, CtError, CtInfo, CtState};
pub use engine::{HookPoint, NatEngine, NatError, Verdict};
pub use expect::{ExpectError, ExpectTemplate, Expectation};
pub use helper::{
    HelperContext, HelperError, HelperId, HelperRegistry, NatHelper, RegistryError,
};
pub use icmp_error_msg::{EmbeddedTranslator, IcmpErrorMsgError, IcmpTranslator};
pub use mangle::{MangleError, mangle_tcp_packet, mangle_udp_packet};
pub use port::NatPort;
pub use route::{RouteError, Router};
pub use tuple::{ConnDirection, Endpoint, ManipType, Tuple, TupleMask};
