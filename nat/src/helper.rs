// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Application level gateway helpers.
//!
//! A helper is registered for a masked tuple (typically a protocol and a well-known port). The
//! first time a connection is bound, the registry is searched with the connection's tuple and
//! the result is cached in the connection's [`crate::state::NatState`]. The engine then hands
//! the connection's packets to the helper, along with a [`HelperContext`] to rewrite payloads
//! and expect related connections.

use crate::conntrack::{ConnTracker, Connection, CtInfo};
use crate::engine::{HookPoint, Verdict};
use crate::expect::{ExpectError, ExpectTemplate, ExpectationManager};
use crate::mangle::{MangleError, mangle_tcp_packet, mangle_udp_packet};
use crate::ratelimit::RateLimiter;
use crate::seqadj::SeqEdit;
use crate::stats;
use crate::tuple::{Tuple, TupleMask};
use concurrency::EpochDomain;
use concurrency::sync::atomic::{AtomicU64, Ordering};
use concurrency::sync::{Arc, PoisonError, RwLock};
use net::buffer::PacketBufferMut;
use net::packet::Packet;
use std::fmt::{Debug, Display, Formatter};
use tracing::{debug, info, warn};

/// Identifies a registered helper. Identifiers are never reused by a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HelperId(u64);

impl HelperId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for HelperId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error(transparent)]
    Mangle(#[from] MangleError),
    #[error(transparent)]
    Expect(#[from] ExpectError),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("helper {name} collides with registered helper {existing}")]
    AlreadyRegistered { name: String, existing: HelperId },
    #[error("no helper {0}")]
    NotRegistered(HelperId),
}

/// Per-packet callback of a helper.
///
/// Any closure with the right signature is a helper.
pub trait NatHelper<Buf: PacketBufferMut>: Send + Sync {
    /// Inspect (and possibly rewrite) a packet of a connection the helper is assigned to.
    ///
    /// The packet's headers are already translated when the helper runs.
    ///
    /// # Errors
    ///
    /// An error drops the packet.
    fn help(&self, ctx: &HelperContext<'_>, packet: &mut Packet<Buf>)
    -> Result<Verdict, HelperError>;
}

impl<Buf, F> NatHelper<Buf> for F
where
    Buf: PacketBufferMut,
    F: Fn(&HelperContext<'_>, &mut Packet<Buf>) -> Result<Verdict, HelperError> + Send + Sync,
{
    fn help(
        &self,
        ctx: &HelperContext<'_>,
        packet: &mut Packet<Buf>,
    ) -> Result<Verdict, HelperError> {
        self(ctx, packet)
    }
}

/// A helper and the tuples it applies to.
pub struct HelperRegistration<Buf: PacketBufferMut> {
    pub id: HelperId,
    pub tuple: Tuple,
    pub mask: TupleMask,
    pub name: String,
    helper: Box<dyn NatHelper<Buf>>,
}

impl<Buf: PacketBufferMut> HelperRegistration<Buf> {
    /// Returns true if this helper applies to connections with tuple `tuple`.
    #[must_use]
    pub fn matches(&self, tuple: &Tuple) -> bool {
        tuple.masked_eq(&self.tuple, &self.mask)
    }

    pub(crate) fn help(
        &self,
        ctx: &HelperContext<'_>,
        packet: &mut Packet<Buf>,
    ) -> Result<Verdict, HelperError> {
        self.helper.help(ctx, packet)
    }
}

impl<Buf: PacketBufferMut> Debug for HelperRegistration<Buf> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperRegistration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("tuple", &self.tuple)
            .field("mask", &self.mask)
            .finish_non_exhaustive()
    }
}

/// The set of registered helpers.
///
/// Lookups take the read lock and run in parallel. Registration and removal take the write lock;
/// removal then waits for the packets in flight to leave the epoch domain before tearing down
/// the connections that used the helper.
pub struct HelperRegistry<Buf: PacketBufferMut> {
    // newest first
    helpers: RwLock<Vec<Arc<HelperRegistration<Buf>>>>,
    next_id: AtomicU64,
    epoch: Arc<EpochDomain>,
    tracker: Arc<dyn ConnTracker>,
}

impl<Buf: PacketBufferMut> Debug for HelperRegistry<Buf> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let helpers = self.helpers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("HelperRegistry")
            .field("helpers", &*helpers)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl<Buf: PacketBufferMut> HelperRegistry<Buf> {
    #[must_use]
    pub fn new(tracker: Arc<dyn ConnTracker>, epoch: Arc<EpochDomain>) -> Self {
        Self {
            helpers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            epoch,
            tracker,
        }
    }

    /// Register `helper` for connections whose tuple matches `tuple` on the bits of `mask`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if a helper with the same mask and the same
    /// masked tuple exists. The registry is left unchanged.
    pub fn register(
        &self,
        tuple: Tuple,
        mask: TupleMask,
        name: impl Into<String>,
        helper: impl NatHelper<Buf> + 'static,
    ) -> Result<HelperId, RegistryError> {
        let name = name.into();
        let mut helpers = self.helpers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = helpers
            .iter()
            .find(|h| h.mask == mask && h.tuple.masked_eq(&tuple, &mask))
        {
            return Err(RegistryError::AlreadyRegistered {
                name,
                existing: existing.id,
            });
        }
        let id = HelperId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!("registered helper {name} {id} for {tuple}");
        helpers.insert(
            0,
            Arc::new(HelperRegistration {
                id,
                tuple,
                mask,
                name,
                helper: Box::new(helper),
            }),
        );
        Ok(id)
    }

    /// Remove a helper and tear down every connection it was assigned to.
    ///
    /// Blocks until packet processing that may still use the helper has completed, so it must
    /// not be called from packet processing. Returns the number of connections torn down.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if there is no such helper.
    pub fn unregister(&self, id: HelperId) -> Result<usize, RegistryError> {
        let removed = {
            let mut helpers = self.helpers.write().unwrap_or_else(PoisonError::into_inner);
            let pos = helpers
                .iter()
                .position(|h| h.id == id)
                .ok_or(RegistryError::NotRegistered(id))?;
            helpers.remove(pos)
        };
        self.epoch.synchronize();

        // collect first: the tracker may not be modified while it is being walked
        let mut doomed = Vec::new();
        self.tracker.for_each_connection(&mut |conn| {
            if conn.nat.helper() == Some(id) {
                doomed.push(conn.clone());
            }
        });
        for conn in &doomed {
            self.tracker.teardown(conn);
        }
        stats::helper_teardowns(doomed.len() as u64);
        info!(
            "unregistered helper {} {id}, {} connection(s) torn down",
            removed.name,
            doomed.len()
        );
        Ok(doomed.len())
    }

    /// The most recently registered helper matching `tuple`
    #[must_use]
    pub fn find(&self, tuple: &Tuple) -> Option<HelperId> {
        self.helpers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|h| h.matches(tuple))
            .map(|h| h.id)
    }

    #[must_use]
    pub fn get(&self, id: HelperId) -> Option<Arc<HelperRegistration<Buf>>> {
        self.helpers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|h| h.id == id)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.helpers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a helper gets to work with, besides the packet.
#[derive(Debug)]
pub struct HelperContext<'a> {
    pub conn: &'a Arc<Connection>,
    pub info: CtInfo,
    pub hook: HookPoint,
    expectations: &'a ExpectationManager,
    limiter: &'a RateLimiter,
}

impl<'a> HelperContext<'a> {
    pub(crate) fn new(
        conn: &'a Arc<Connection>,
        info: CtInfo,
        hook: HookPoint,
        expectations: &'a ExpectationManager,
        limiter: &'a RateLimiter,
    ) -> Self {
        Self {
            conn,
            info,
            hook,
            expectations,
            limiter,
        }
    }

    /// Rewrite part of the TCP payload; see [`mangle_tcp_packet`].
    ///
    /// # Errors
    ///
    /// Propagates the [`MangleError`]; the packet must then be dropped.
    pub fn mangle_tcp<Buf: PacketBufferMut>(
        &self,
        packet: &mut Packet<Buf>,
        match_offset: usize,
        match_len: usize,
        replacement: &[u8],
    ) -> Result<(), HelperError> {
        let edit = mangle_tcp_packet(
            packet,
            self.conn,
            self.info.dir,
            match_offset,
            match_len,
            replacement,
        )?;
        match edit {
            SeqEdit::Stale => {
                if self.limiter.allow() {
                    warn!(
                        "connection {}: {} rewrite behind the correction window, sequence space not adjusted",
                        self.conn.id(),
                        self.info.dir
                    );
                }
            }
            SeqEdit::Retransmit => {
                debug!(
                    "connection {}: rewrite of a retransmitted segment",
                    self.conn.id()
                );
            }
            SeqEdit::Unchanged | SeqEdit::Recorded => {}
        }
        Ok(())
    }

    /// Rewrite part of the UDP payload; see [`mangle_udp_packet`].
    ///
    /// # Errors
    ///
    /// Propagates the [`MangleError`]; the packet must then be dropped.
    pub fn mangle_udp<Buf: PacketBufferMut>(
        &self,
        packet: &mut Packet<Buf>,
        match_offset: usize,
        match_len: usize,
        replacement: &[u8],
    ) -> Result<(), HelperError> {
        Ok(mangle_udp_packet(
            packet,
            match_offset,
            match_len,
            replacement,
        )?)
    }

    /// Expect a connection related to this one; see [`ExpectationManager::predict`].
    ///
    /// # Errors
    ///
    /// Fails if no port of the probed range is free.
    pub fn expect(&self, template: &ExpectTemplate) -> Result<Tuple, HelperError> {
        Ok(self.expectations.predict(self.conn, template)?)
    }
}
