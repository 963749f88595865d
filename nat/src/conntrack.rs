// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Connection tracking, as consumed by the NAT engine.
//!
//! The engine only needs tracking through the [`ConnTracker`] trait. [`ConnTable`] is an
//! in-memory implementation: connections are indexed by both of their tuples in a concurrent
//! hash map, expectations are kept in a list and matched against the first packet of new
//! connections. It does no garbage collection: connections live until they are torn down.

use crate::expect::Expectation;
use crate::state::NatState;
use crate::tuple::{ConnDirection, Endpoint, PacketKey, Tuple};
use ahash::RandomState;
use concurrency::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use concurrency::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use etherparse::IpNumber;
use std::fmt::Debug;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tracking state of a connection, from the point of view of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtState {
    /// First packet(s) of a connection, no reply seen yet
    New,
    /// The connection has seen traffic in both directions
    Established,
    /// An expected connection before its first reply, or an ICMP error about a connection
    Related,
}

/// What connection tracking reports about one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtInfo {
    pub state: CtState,
    pub dir: ConnDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CtError {
    #[error("TCP segment {0} belongs to no connection and is not an initial SYN")]
    Invalid(Tuple),
    #[error("no connection matches the datagram quoted by an ICMP error: {0}")]
    NoConnection(Tuple),
    #[error("tuple {0} is already in use")]
    Clash(Tuple),
    #[error("expectation {0} clashes with an existing one")]
    ExpectClash(Tuple),
    #[error("master connection is gone")]
    MasterGone,
}

/// A tracked connection.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    tuples: RwLock<[Tuple; 2]>,
    master: Option<Weak<Connection>>,
    saved: Option<Endpoint>,
    seen_reply: AtomicBool,
    dying: AtomicBool,
    pub nat: NatState,
}

impl Connection {
    /// A connection whose first packet had tuple `original`.
    #[must_use]
    pub fn new(id: u64, original: Tuple) -> Self {
        Self {
            id,
            tuples: RwLock::new([original, original.invert()]),
            master: None,
            saved: None,
            seen_reply: AtomicBool::new(false),
            dying: AtomicBool::new(false),
            nat: NatState::new(),
        }
    }

    /// A connection created by matching an expectation of `master`.
    ///
    /// `saved` is the endpoint announced by the master's peer before it was rewritten, if the
    /// expectation carried one.
    #[must_use]
    pub fn new_expected(
        id: u64,
        original: Tuple,
        master: &Arc<Connection>,
        saved: Option<Endpoint>,
    ) -> Self {
        Self {
            master: Some(Arc::downgrade(master)),
            saved,
            ..Self::new(id, original)
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn tuple(&self, dir: ConnDirection) -> Tuple {
        self.tuples.read().unwrap_or_else(PoisonError::into_inner)[dir.index()]
    }

    /// Replace the reply tuple. For use by trackers, which must re-index the connection.
    pub fn set_reply_tuple(&self, reply: Tuple) {
        self.tuples.write().unwrap_or_else(PoisonError::into_inner)[ConnDirection::Reply.index()] =
            reply;
    }

    /// The connection whose helper expected this one, if it is still alive
    #[must_use]
    pub fn master(&self) -> Option<Arc<Connection>> {
        self.master.as_ref().and_then(Weak::upgrade)
    }

    /// Returns true if this connection was created from an expectation.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        self.master.is_some()
    }

    #[must_use]
    pub fn saved_endpoint(&self) -> Option<Endpoint> {
        self.saved
    }

    #[must_use]
    pub fn seen_reply(&self) -> bool {
        self.seen_reply.load(Ordering::Acquire)
    }

    pub fn set_seen_reply(&self) {
        self.seen_reply.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    /// Mark the connection as dying. Returns false if it already was.
    pub fn set_dying(&self) -> bool {
        !self.dying.swap(true, Ordering::AcqRel)
    }

    /// State reported for a packet of this connection travelling in `dir`.
    #[must_use]
    pub fn info(&self, dir: ConnDirection) -> CtInfo {
        let state = match dir {
            ConnDirection::Reply => CtState::Established,
            ConnDirection::Original if self.seen_reply() => CtState::Established,
            ConnDirection::Original if self.is_expected() => CtState::Related,
            ConnDirection::Original => CtState::New,
        };
        CtInfo { state, dir }
    }
}

/// The connection tracking collaborator of the NAT engine.
pub trait ConnTracker: Debug + Send + Sync {
    /// Find or create the connection of a packet.
    ///
    /// `ICMPv4` errors are classified as [`CtState::Related`] to the connection of the datagram
    /// they quote.
    ///
    /// # Errors
    ///
    /// Fails if the packet cannot be attributed to a connection.
    fn classify(&self, key: &PacketKey) -> Result<(Arc<Connection>, CtInfo), CtError>;

    /// Change the reply tuple of `conn`, after a binding changed it.
    ///
    /// # Errors
    ///
    /// Returns [`CtError::Clash`] if another connection already uses `reply`.
    fn rehash_reply(&self, conn: &Arc<Connection>, reply: Tuple) -> Result<(), CtError>;

    /// Register an expectation.
    ///
    /// # Errors
    ///
    /// Returns [`CtError::ExpectClash`] if the expectation overlaps an existing expectation or
    /// connection.
    fn expect_related(&self, expectation: Expectation) -> Result<(), CtError>;

    /// Destroy a connection: it is marked dying and forgotten.
    fn teardown(&self, conn: &Arc<Connection>);

    /// Visit every connection once.
    fn for_each_connection(&self, f: &mut dyn FnMut(&Arc<Connection>));
}

type Entries = DashMap<Tuple, (Arc<Connection>, ConnDirection), RandomState>;

/// In-memory connection table.
#[derive(Debug)]
pub struct ConnTable {
    conns: Entries,
    expectations: Mutex<Vec<Expectation>>,
    next_id: AtomicU64,
    expect_timeout: Duration,
}

impl ConnTable {
    #[must_use]
    pub fn new(expect_timeout: Duration) -> Self {
        Self {
            conns: DashMap::with_hasher(RandomState::new()),
            expectations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            expect_timeout,
        }
    }

    /// Number of tracked connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns
            .iter()
            .filter(|e| e.value().1 == ConnDirection::Original)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Number of pending expectations, expired ones included
    #[must_use]
    pub fn expectation_count(&self) -> usize {
        self.expectations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The connection indexed under `tuple`, and the direction `tuple` belongs to
    #[must_use]
    pub fn get(&self, tuple: &Tuple) -> Option<(Arc<Connection>, ConnDirection)> {
        self.conns.get(tuple).map(|e| e.value().clone())
    }

    fn is_live(&self, expectation: &Expectation, now: Instant) -> bool {
        !expectation.is_expired(self.expect_timeout, now)
            && expectation.master().is_some_and(|m| !m.is_dying())
    }

    /// Remove and return the first live expectation matching `tuple`.
    fn take_expectation(&self, tuple: &Tuple) -> Option<Expectation> {
        let now = Instant::now();
        let mut expectations = self
            .expectations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        expectations.retain(|e| self.is_live(e, now));
        let pos = expectations.iter().position(|e| e.matches(tuple))?;
        Some(expectations.swap_remove(pos))
    }

    /// Put back an expectation taken for a connection that could not be created.
    fn restore_expectation(&self, expectation: Expectation) {
        self.expectations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(expectation);
    }

    fn new_connection(
        &self,
        tuple: Tuple,
        expectation: Option<&Expectation>,
    ) -> Result<Arc<Connection>, CtError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let Some(expectation) = expectation else {
            return Ok(Arc::new(Connection::new(id, tuple)));
        };
        let master = expectation.master().ok_or(CtError::MasterGone)?;
        debug!(
            "connection {id} {tuple} expected by connection {}",
            master.id()
        );
        Ok(Arc::new(Connection::new_expected(
            id,
            tuple,
            &master,
            expectation.saved,
        )))
    }

    fn create(&self, key: &PacketKey) -> Result<(Arc<Connection>, CtInfo), CtError> {
        let tuple = key.tuple;

        let conn;
        let expectation;
        // held until both tuples are indexed, binding setup re-indexes the reply tuple
        let setup;
        // one entry at a time: both tuples may hash to the same shard
        match self.conns.entry(tuple) {
            Entry::Occupied(entry) => {
                // created by another packet in the meantime
                let (existing, dir) = entry.get().clone();
                let info = existing.info(dir);
                return Ok((existing, info));
            }
            Entry::Vacant(entry) => {
                // the entry is held: other creators of this tuple wait for the connection
                expectation = self.take_expectation(&tuple);
                conn = self.new_connection(tuple, expectation.as_ref())?;
                setup = conn.nat.lock_setup();
                entry.insert((conn.clone(), ConnDirection::Original));
            }
        }
        let reply = conn.tuple(ConnDirection::Reply);
        let clash = match self.conns.entry(reply) {
            Entry::Occupied(_) => true,
            Entry::Vacant(entry) => {
                entry.insert((conn.clone(), ConnDirection::Reply));
                false
            }
        };
        if clash {
            self.conns
                .remove_if(&tuple, |_, (c, _)| Arc::ptr_eq(c, &conn));
            if let Some(expectation) = expectation {
                self.restore_expectation(expectation);
            }
            return Err(CtError::Clash(reply));
        }
        drop(setup);
        debug!("new connection {}: {tuple}", conn.id());
        let info = conn.info(ConnDirection::Original);
        Ok((conn, info))
    }
}

impl ConnTracker for ConnTable {
    fn classify(&self, key: &PacketKey) -> Result<(Arc<Connection>, CtInfo), CtError> {
        if let Some(quoted) = key.icmp_error {
            // the quoted datagram travelled the other way: look up its reverse
            let (conn, dir) = self
                .get(&quoted.invert())
                .ok_or(CtError::NoConnection(quoted))?;
            return Ok((
                conn,
                CtInfo {
                    state: CtState::Related,
                    dir,
                },
            ));
        }
        if let Some((conn, dir)) = self.get(&key.tuple) {
            if dir == ConnDirection::Reply {
                conn.set_seen_reply();
            }
            let info = conn.info(dir);
            return Ok((conn, info));
        }
        if key.tuple.proto == IpNumber::TCP && !key.initial_syn {
            return Err(CtError::Invalid(key.tuple));
        }
        self.create(key)
    }

    fn rehash_reply(&self, conn: &Arc<Connection>, reply: Tuple) -> Result<(), CtError> {
        let old = conn.tuple(ConnDirection::Reply);
        if old == reply {
            return Ok(());
        }
        match self.conns.entry(reply) {
            Entry::Occupied(entry) if !Arc::ptr_eq(&entry.get().0, conn) => {
                return Err(CtError::Clash(reply));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                entry.insert((conn.clone(), ConnDirection::Reply));
            }
        }
        self.conns.remove_if(&old, |_, (c, _)| Arc::ptr_eq(c, conn));
        conn.set_reply_tuple(reply);
        debug!("connection {} reply tuple {old} -> {reply}", conn.id());
        Ok(())
    }

    fn expect_related(&self, expectation: Expectation) -> Result<(), CtError> {
        if self.conns.contains_key(&expectation.tuple) {
            return Err(CtError::ExpectClash(expectation.tuple));
        }
        let now = Instant::now();
        let mut expectations = self
            .expectations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        expectations.retain(|e| self.is_live(e, now));
        let overlaps = expectations.iter().any(|e| {
            e.tuple
                .masked_eq(&expectation.tuple, &e.mask.intersect(&expectation.mask))
        });
        if overlaps {
            return Err(CtError::ExpectClash(expectation.tuple));
        }
        debug!("expecting {}", expectation.tuple);
        expectations.push(expectation);
        Ok(())
    }

    fn teardown(&self, conn: &Arc<Connection>) {
        if !conn.set_dying() {
            return;
        }
        for dir in [ConnDirection::Original, ConnDirection::Reply] {
            self.conns
                .remove_if(&conn.tuple(dir), |_, (c, _)| Arc::ptr_eq(c, conn));
        }
        self.expectations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|e| e.master().is_some_and(|m| !Arc::ptr_eq(&m, conn)));
        debug!("connection {} torn down", conn.id());
    }

    fn for_each_connection(&self, f: &mut dyn FnMut(&Arc<Connection>)) {
        for entry in &self.conns {
            let (conn, dir) = entry.value();
            if *dir == ConnDirection::Original {
                f(conn);
            }
        }
    }
}
