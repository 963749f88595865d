// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Expected (secondary) connections.
//!
//! A helper that sees an endpoint announcement in a payload predicts the tuple of the
//! connection the peer is about to open and registers it with the tracker. When that connection
//! shows up it is related to the announcing (master) connection, and its bindings are derived
//! from the master's.

use crate::conntrack::{ConnTracker, Connection, CtError};
use crate::stats;
use crate::tuple::{Endpoint, Tuple, TupleMask};
use concurrency::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// A connection expected by a helper of `master`.
#[derive(Debug, Clone)]
pub struct Expectation {
    pub tuple: Tuple,
    pub mask: TupleMask,
    /// Endpoint the master's peer announced before it was rewritten
    pub saved: Option<Endpoint>,
    master: Weak<Connection>,
    created: Instant,
}

impl Expectation {
    #[must_use]
    pub fn new(
        master: &Arc<Connection>,
        tuple: Tuple,
        mask: TupleMask,
        saved: Option<Endpoint>,
    ) -> Self {
        Self {
            tuple,
            mask,
            saved,
            master: Arc::downgrade(master),
            created: Instant::now(),
        }
    }

    /// The master connection, if it is still alive
    #[must_use]
    pub fn master(&self) -> Option<Arc<Connection>> {
        self.master.upgrade()
    }

    #[must_use]
    pub fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created) >= timeout
    }

    /// Returns true if a connection with tuple `tuple` is the expected one.
    #[must_use]
    pub fn matches(&self, tuple: &Tuple) -> bool {
        tuple.masked_eq(&self.tuple, &self.mask)
    }
}

/// What a helper knows about the connection it expects.
///
/// The destination port of `tuple` is where the search for a free slot starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectTemplate {
    pub tuple: Tuple,
    pub mask: TupleMask,
    pub saved: Option<Endpoint>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExpectError {
    #[error("no free port in {base}..+{range} for the expected connection")]
    NoFreeSlot { base: u16, range: u16 },
    #[error(transparent)]
    Tracker(#[from] CtError),
}

/// Registers expectations on behalf of helpers.
#[derive(Debug)]
pub struct ExpectationManager {
    tracker: Arc<dyn ConnTracker>,
    port_range: u16,
}

impl ExpectationManager {
    #[must_use]
    pub fn new(tracker: Arc<dyn ConnTracker>, port_range: u16) -> Self {
        Self {
            tracker,
            port_range,
        }
    }

    /// Register an expectation for the connection described by `template`, trying successive
    /// destination ports until the tracker accepts one.
    ///
    /// Returns the tuple actually expected; the helper must announce its destination port.
    ///
    /// # Errors
    ///
    /// * [`ExpectError::NoFreeSlot`] if every port of the range clashes,
    /// * [`ExpectError::Tracker`] if the tracker refused the expectation for another reason.
    pub fn predict(
        &self,
        master: &Arc<Connection>,
        template: &ExpectTemplate,
    ) -> Result<Tuple, ExpectError> {
        let base = template.tuple.dst.port;
        for i in 0..self.port_range {
            let port = base.wrapping_add(i);
            if port == 0 {
                continue;
            }
            let mut tuple = template.tuple;
            tuple.dst.port = port;
            let expectation = Expectation::new(master, tuple, template.mask, template.saved);
            match self.tracker.expect_related(expectation) {
                Ok(()) => {
                    stats::expectation("ok");
                    debug!("connection {} expects {tuple}", master.id());
                    return Ok(tuple);
                }
                Err(CtError::ExpectClash(_)) => {}
                Err(e) => {
                    stats::expectation("refused");
                    return Err(e.into());
                }
            }
        }
        stats::expectation("no_free_slot");
        Err(ExpectError::NoFreeSlot {
            base,
            range: self.port_range,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::ConnTable;
    use crate::tuple::PacketKey;
    use etherparse::IpNumber;
    use std::net::Ipv4Addr;

    fn ep(addr: &str, port: u16) -> Endpoint {
        Endpoint::new(addr.parse::<Ipv4Addr>().unwrap(), port)
    }

    fn master(table: &ConnTable) -> Arc<Connection> {
        let control = Tuple::new(
            IpNumber::TCP,
            ep("10.0.0.1", 1000),
            ep("192.0.2.1", 21),
        );
        let key = PacketKey {
            tuple: control,
            initial_syn: true,
            icmp_error: None,
        };
        table.classify(&key).unwrap().0
    }

    fn template(port: u16) -> ExpectTemplate {
        ExpectTemplate {
            tuple: Tuple::new(IpNumber::TCP, ep("192.0.2.1", 0), ep("203.0.113.1", port)),
            mask: TupleMask::any_src_port(),
            saved: Some(ep("10.0.0.1", 5000)),
        }
    }

    #[test]
    fn predict_probes_next_port() {
        let table = Arc::new(ConnTable::new(Duration::from_secs(60)));
        let master = master(&table);
        let manager = ExpectationManager::new(table.clone(), 4);
        let first = manager.predict(&master, &template(5000)).unwrap();
        assert_eq!(first.dst.port, 5000);
        let second = manager.predict(&master, &template(5000)).unwrap();
        assert_eq!(second.dst.port, 5001);
        assert_eq!(table.expectation_count(), 2);
    }

    #[test]
    fn predict_skips_port_zero() {
        let table = Arc::new(ConnTable::new(Duration::from_secs(60)));
        let master = master(&table);
        let manager = ExpectationManager::new(table, 4);
        manager.predict(&master, &template(u16::MAX)).unwrap();
        let next = manager.predict(&master, &template(u16::MAX)).unwrap();
        assert_eq!(next.dst.port, 1);
    }

    #[test]
    fn predict_exhausts_range() {
        let table = Arc::new(ConnTable::new(Duration::from_secs(60)));
        let master = master(&table);
        let manager = ExpectationManager::new(table, 2);
        manager.predict(&master, &template(6000)).unwrap();
        manager.predict(&master, &template(6000)).unwrap();
        assert!(matches!(
            manager.predict(&master, &template(6000)),
            Err(ExpectError::NoFreeSlot {
                base: 6000,
                range: 2
            })
        ));
    }
}
