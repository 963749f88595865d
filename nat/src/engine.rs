// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The NAT hook dispatcher.
//!
//! [`NatEngine::hook`] is called for every packet at each of the three hook points. The first
//! hook a packet goes through attaches it to its connection; the next ones reuse the attachment
//! since the packet's addresses may have been translated in between. Each hook computes the
//! connection's binding for the hook's manipulation the first time it is needed, rewrites the
//! packet accordingly and runs the connection's helper.

use crate::binding::{
    BindingError, BindingRequest, BindingResolver, Mapping, apply_mapping, manip_packet,
};
use crate::config::{ConfigError, NatConfig};
use crate::conntrack::{ConnTracker, Connection, CtError, CtInfo, CtState};
use crate::expect::ExpectationManager;
use crate::helper::{HelperContext, HelperError, HelperId, HelperRegistry};
use crate::icmp_error_msg::{EmbeddedTranslator, IcmpErrorMsgError, IcmpTranslator};
use crate::mangle::MangleError;
use crate::ratelimit::RateLimiter;
use crate::route::{RouteError, Router, refix_route};
use crate::sack::strip_sack_permitted;
use crate::seqadj::{self, SeqAdjError};
use crate::state::HelperSlot;
use crate::stats;
use crate::tuple::{ConnDirection, ManipType, PacketKey, TupleError};
use concurrency::EpochDomain;
use concurrency::sync::Arc;
use etherparse::IpNumber;
use net::buffer::{BufferError, PacketBufferMut};
use net::packet::{DoneReason, InterfaceId, Packet, PacketError};
use std::fmt::{Debug, Display, Formatter};
use std::net::Ipv4Addr;
use tracing::{debug, trace, warn};

/// Priorities of the hooks, lower runs first.
pub mod priority {
    /// Destination NAT, before filtering on input
    pub const NAT_DST: i32 = -100;
    pub const FILTER: i32 = 0;
    /// Source NAT, after filtering on output
    pub const NAT_SRC: i32 = 100;
}

/// Where a packet is in the forwarding path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Received, not routed yet
    PreRouting,
    /// Routed, about to be sent
    PostRouting,
    /// Generated by the local host
    LocalOut,
}

impl HookPoint {
    /// The endpoint translated at this hook
    #[must_use]
    pub fn manip(self) -> ManipType {
        match self {
            HookPoint::PreRouting => ManipType::Dst,
            HookPoint::PostRouting | HookPoint::LocalOut => ManipType::Src,
        }
    }

    #[must_use]
    pub fn priority(self) -> i32 {
        match self.manip() {
            ManipType::Dst => priority::NAT_DST,
            ManipType::Src => priority::NAT_SRC,
        }
    }
}

impl Display for HookPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HookPoint::PreRouting => write!(f, "pre-routing"),
            HookPoint::PostRouting => write!(f, "post-routing"),
            HookPoint::LocalOut => write!(f, "local-out"),
        }
    }
}

/// What the caller of a hook does with the packet next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue processing
    Accept,
    /// Discard; the packet is marked done with the reason
    Drop,
    /// A helper took ownership of the packet
    Stolen,
    /// Run the hook again
    Repeat,
}

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error(transparent)]
    Key(#[from] TupleError),
    #[error(transparent)]
    Tracking(#[from] CtError),
    #[error("connection {0} is being torn down")]
    Dying(u64),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Helper(#[from] HelperError),
    #[error("helper {0} is no longer registered")]
    StaleHelper(HelperId),
    #[error(transparent)]
    SeqAdj(#[from] SeqAdjError),
    #[error(transparent)]
    IcmpError(#[from] IcmpErrorMsgError),
    #[error(transparent)]
    Route(#[from] RouteError),
}

fn packet_reason(e: &PacketError) -> DoneReason {
    match e {
        PacketError::TooLong(_) => DoneReason::TooLong,
        PacketError::Buffer(BufferError::AllocationFailed(_)) => DoneReason::NatOutOfResources,
        PacketError::Buffer(_) => DoneReason::InternalFailure,
        _ => DoneReason::Malformed,
    }
}

impl NatError {
    /// The reason recorded on packets dropped because of this error
    #[must_use]
    pub fn done_reason(&self) -> DoneReason {
        match self {
            NatError::Key(TupleError::Packet(e)) | NatError::Packet(e) => packet_reason(e),
            NatError::Key(_) | NatError::Dying(_) => DoneReason::Untracked,
            NatError::Tracking(CtError::Clash(_) | CtError::ExpectClash(_)) => {
                DoneReason::NatConflict
            }
            NatError::Tracking(_) => DoneReason::Untracked,
            NatError::Binding(BindingError::Exhausted(_)) => DoneReason::NatOutOfResources,
            NatError::Binding(BindingError::Refused(_)) => DoneReason::NatFailure,
            NatError::Helper(HelperError::Mangle(MangleError::TooLong(_))) => DoneReason::TooLong,
            NatError::Helper(HelperError::Mangle(MangleError::Packet(e))) => packet_reason(e),
            NatError::Helper(_) | NatError::StaleHelper(_) => DoneReason::HelperFailure,
            NatError::SeqAdj(SeqAdjError::Packet(e)) => packet_reason(e),
            NatError::IcmpError(IcmpErrorMsgError::Packet(e)) => packet_reason(e),
            NatError::IcmpError(_) => DoneReason::Malformed,
            NatError::Route(RouteError::NoRoute { .. }) => DoneReason::RouteFailure,
            NatError::Route(RouteError::Packet(e)) => packet_reason(e),
        }
    }
}

/// The address of the master connection an expected connection should use for `manip`, if
/// the expected connection shares an endpoint address with it.
fn master_hint(master: &Connection, child: &Connection, manip: ManipType) -> Option<Ipv4Addr> {
    let child = child.tuple(ConnDirection::Original);
    let orig = master.tuple(ConnDirection::Original);
    let reply = master.tuple(ConnDirection::Reply);
    match manip {
        ManipType::Src if child.src.addr == orig.src.addr => Some(reply.dst.addr),
        ManipType::Src if child.src.addr == reply.src.addr => Some(orig.dst.addr),
        ManipType::Dst if child.dst.addr == reply.dst.addr => Some(orig.src.addr),
        ManipType::Dst if child.dst.addr == orig.dst.addr => Some(reply.src.addr),
        ManipType::Src | ManipType::Dst => None,
    }
}

/// Connection state carried by a packet from the hook that classified it to the next ones.
struct Attachment {
    conn: Arc<Connection>,
    info: CtInfo,
    icmp_error: bool,
}

fn addresses<Buf: PacketBufferMut>(
    packet: &Packet<Buf>,
) -> Result<(Ipv4Addr, Ipv4Addr), PacketError> {
    let ip = packet.ipv4()?;
    Ok((ip.source(), ip.destination()))
}

/// A stateful NAT service.
///
/// The engine is shared by every CPU processing packets; all its methods take `&self`.
pub struct NatEngine<Buf: PacketBufferMut> {
    config: NatConfig,
    tracker: Arc<dyn ConnTracker>,
    resolver: Box<dyn BindingResolver>,
    router: Box<dyn Router>,
    icmp: Box<dyn IcmpTranslator<Buf>>,
    helpers: HelperRegistry<Buf>,
    expectations: ExpectationManager,
    epoch: Arc<EpochDomain>,
    limiter: RateLimiter,
}

impl<Buf: PacketBufferMut> Debug for NatEngine<Buf> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatEngine")
            .field("config", &self.config)
            .field("tracker", &self.tracker)
            .field("helpers", &self.helpers)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl<Buf: PacketBufferMut> NatEngine<Buf> {
    /// Create an engine.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration does not validate.
    pub fn new(
        config: NatConfig,
        tracker: Arc<dyn ConnTracker>,
        resolver: impl BindingResolver + 'static,
        router: impl Router + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        stats::describe();
        let epoch = Arc::new(EpochDomain::new());
        debug!("creating NAT engine\n{config}");
        Ok(Self {
            helpers: HelperRegistry::new(tracker.clone(), epoch.clone()),
            expectations: ExpectationManager::new(tracker.clone(), config.expect_port_range),
            limiter: RateLimiter::new(config.log_burst, config.log_interval),
            icmp: Box::new(EmbeddedTranslator),
            resolver: Box::new(resolver),
            router: Box::new(router),
            config,
            tracker,
            epoch,
        })
    }

    /// Replace the translator of `ICMPv4` error messages.
    #[must_use]
    pub fn with_icmp_translator(mut self, translator: impl IcmpTranslator<Buf> + 'static) -> Self {
        self.icmp = Box::new(translator);
        self
    }

    #[must_use]
    pub fn helpers(&self) -> &HelperRegistry<Buf> {
        &self.helpers
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<dyn ConnTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    /// Process `packet` at `hook`.
    ///
    /// Never fails: errors drop the packet, which is marked done with the reason.
    pub fn hook(
        &self,
        hook: HookPoint,
        packet: &mut Packet<Buf>,
        in_if: Option<InterfaceId>,
        out_if: Option<InterfaceId>,
    ) -> Verdict {
        if in_if.is_some() {
            packet.meta.iif = in_if;
        }
        if out_if.is_some() {
            packet.meta.oif = out_if;
        }
        let _guard = self.epoch.enter();
        match self.process(hook, packet) {
            Ok(verdict) => verdict,
            Err(e) => {
                let reason = e.done_reason();
                packet.done(reason);
                stats::drop(reason);
                if self.limiter.allow() {
                    warn!("{hook}: dropping packet ({}): {e}", reason.as_str());
                }
                Verdict::Drop
            }
        }
    }

    fn process(&self, hook: HookPoint, packet: &mut Packet<Buf>) -> Result<Verdict, NatError> {
        let (conn, info, icmp_error) = self.attach(packet)?;
        if conn.is_dying() {
            return Err(NatError::Dying(conn.id()));
        }
        let manip = hook.manip();
        let before = match hook {
            HookPoint::LocalOut => Some(addresses(packet)?),
            HookPoint::PreRouting | HookPoint::PostRouting => None,
        };

        let verdict = if icmp_error {
            if self.icmp.translate(packet, &conn, info.dir, manip)? {
                trace!("{hook}: translated ICMP error for connection {}", conn.id());
            }
            Verdict::Accept
        } else {
            if matches!(info.state, CtState::New | CtState::Related)
                && !conn.nat.is_initialized(manip)
            {
                self.setup_binding(&conn, hook)?;
            }
            self.do_bindings(hook, &conn, info, packet)?
        };

        if let Some(before) = before {
            if verdict == Verdict::Accept && addresses(packet)? != before {
                refix_route(self.router.as_ref(), packet)?;
            }
        }
        Ok(verdict)
    }

    /// The connection of `packet`: the one attached by a previous hook, or the tracker's
    /// classification, which is then attached.
    fn attach(
        &self,
        packet: &mut Packet<Buf>,
    ) -> Result<(Arc<Connection>, CtInfo, bool), NatError> {
        let attached = packet
            .meta
            .conntrack
            .as_deref()
            .and_then(|ct| ct.downcast_ref::<Attachment>());
        if let Some(ct) = attached {
            return Ok((ct.conn.clone(), ct.info, ct.icmp_error));
        }
        let key = PacketKey::from_packet(packet)?;
        let (conn, info) = self.tracker.classify(&key)?;
        let icmp_error = key.icmp_error.is_some();
        packet.meta.conntrack = Some(std::sync::Arc::new(Attachment {
            conn: conn.clone(),
            info,
            icmp_error,
        }));
        Ok((conn, info, icmp_error))
    }

    /// Compute the binding of `conn` for the manipulation of `hook`, once.
    fn setup_binding(&self, conn: &Arc<Connection>, hook: HookPoint) -> Result<(), NatError> {
        let manip = hook.manip();
        let _setup = conn.nat.lock_setup();
        if conn.nat.is_initialized(manip) {
            return Ok(());
        }

        // the original tuple, with the bindings computed so far
        let current = conn.tuple(ConnDirection::Reply).invert();
        let target = match (manip, conn.saved_endpoint()) {
            (ManipType::Dst, Some(saved)) => current.with_endpoint(ManipType::Dst, saved),
            _ => {
                let master_addr = conn
                    .master()
                    .and_then(|master| master_hint(&master, conn, manip));
                let request = BindingRequest {
                    tuple: current,
                    hook,
                    manip,
                    master_addr,
                };
                let mapping = match (self.resolver.resolve(&request)?, master_addr) {
                    (mapping, Some(addr)) => {
                        Some(Mapping::new(addr, mapping.and_then(|m| m.port)))
                    }
                    (mapping, None) => mapping,
                };
                mapping.map_or(current, |m| apply_mapping(&current, manip, &m))
            }
        };

        if target != current {
            self.tracker.rehash_reply(conn, target.invert())?;
            conn.nat.set_translated(manip);
            stats::binding(manip);
            debug!("connection {} {manip} binding: {current} -> {target}", conn.id());
        }
        conn.nat.set_initialized(manip);

        if conn.nat.helper_slot() == HelperSlot::Unresolved {
            let slot = if conn.is_expected() {
                HelperSlot::Unassigned
            } else {
                self.helpers
                    .find(&conn.tuple(ConnDirection::Reply).invert())
                    .map_or(HelperSlot::Unassigned, HelperSlot::Assigned)
            };
            if let HelperSlot::Assigned(id) = slot {
                debug!("connection {} assigned helper {id}", conn.id());
            }
            conn.nat.set_helper(slot);
        }
        Ok(())
    }

    /// Apply the bindings of `conn` to `packet` and run its helper.
    fn do_bindings(
        &self,
        hook: HookPoint,
        conn: &Arc<Connection>,
        info: CtInfo,
        packet: &mut Packet<Buf>,
    ) -> Result<Verdict, NatError> {
        let manip = hook.manip();
        let dir = info.dir;
        let bit = match dir {
            ConnDirection::Original => manip,
            ConnDirection::Reply => manip.opposite(),
        };
        if conn.nat.is_translated(bit) {
            let target = conn.tuple(dir.opposite()).invert();
            manip_packet(packet, &target, manip)?;
        }

        let Some(id) = conn.nat.helper() else {
            return Ok(Verdict::Accept);
        };
        let fires = matches!(
            (hook, dir),
            (HookPoint::PostRouting, ConnDirection::Original)
                | (HookPoint::PreRouting, ConnDirection::Reply)
        );
        if !fires {
            return Ok(Verdict::Accept);
        }
        let helper = self.helpers.get(id).ok_or(NatError::StaleHelper(id))?;
        let ctx = HelperContext::new(conn, info, hook, &self.expectations, &self.limiter);
        match helper.help(&ctx, packet)? {
            Verdict::Accept => {}
            Verdict::Drop => {
                packet.done(DoneReason::HelperFailure);
                stats::drop(DoneReason::HelperFailure);
                debug!("helper {} dropped a packet of connection {}", helper.name, conn.id());
                return Ok(Verdict::Drop);
            }
            verdict => return Ok(verdict),
        }

        // once per packet: replies delivered locally never reach post-routing
        if packet.ipv4()?.protocol() == IpNumber::TCP {
            if dir == ConnDirection::Original
                && self.config.strip_sack
                && packet.tcp()?.is_initial_syn()
            {
                strip_sack_permitted(packet)?;
            }
            let (this, other) = conn.nat.seq_offsets(dir);
            seqadj::adjust(packet, &this, &other)?;
        }
        Ok(Verdict::Accept)
    }
}
