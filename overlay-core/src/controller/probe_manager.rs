//! Periodically floods probes for queries this node originates (§4.7).
//!
//! One [`ProbeManager`] exists per query `q` this node wants answered
//! (most nodes run exactly one, for their own tenant). `cid` is rolled
//! once at construction and reused for the manager's lifetime; only
//! `sid` is re-rolled every cycle, so a registry mapping `sid -> q`
//! always has at most one live entry per manager.

use std::collections::HashMap;

use overlay_proto::ids::{Cid, Q, Sid};
use overlay_proto::message::Frame;

use crate::link::LinkHandle;

const DEFAULT_TTL: u8 = 10;

/// Floods `PROBE`s for one query `q` on every connected link.
pub struct ProbeManager {
    q: Q,
    cid: Cid,
    ttl: u8,
    current_sid: Option<Sid>,
}

impl ProbeManager {
    /// Start a manager for `q`, generating its fixed `cid`.
    #[must_use]
    pub fn new(q: Q) -> Self {
        Self { q, cid: Cid::random(), ttl: DEFAULT_TTL, current_sid: None }
    }

    /// Override the TTL stamped on this manager's outgoing probes.
    #[must_use]
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// This manager's query.
    #[must_use]
    pub fn q(&self) -> Q {
        self.q
    }

    /// This manager's fixed channel id.
    #[must_use]
    pub fn cid(&self) -> Cid {
        self.cid
    }

    /// The `sid` currently registered for this manager, if any.
    #[must_use]
    pub fn current_sid(&self) -> Option<Sid> {
        self.current_sid
    }

    /// Re-roll `sid` and flood a fresh `PROBE` on every connected link.
    /// Returns the new `sid` and the previous one (to deregister from
    /// the controller's reverse index, if present).
    pub fn probe(&mut self, connections: &HashMap<overlay_proto::ids::Digest, LinkHandle>) -> (Sid, Option<Sid>) {
        let previous = self.current_sid.take();
        let sid = Sid::random();
        self.current_sid = Some(sid);
        for link in connections.values() {
            link.send_frame(
                None,
                Frame::Probe { q: self.q, cid: self.cid, sid, ttl: self.ttl },
            );
        }
        (sid, previous)
    }
}

/// Maps the live `sid` for each of this node's own probe managers back
/// to the manager itself, so an `ESTABLISH` echoing that `sid` can find
/// the manager that originated it.
#[derive(Default)]
pub struct ProbeManagerRegistry {
    managers: HashMap<Q, ProbeManager>,
    sid_index: HashMap<Sid, Q>,
}

impl ProbeManagerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { managers: HashMap::new(), sid_index: HashMap::new() }
    }

    /// Register a manager for `q`, replacing any previous one.
    pub fn register(&mut self, manager: ProbeManager) {
        self.managers.insert(manager.q(), manager);
    }

    /// Whether `sid` belongs to one of this node's own managers.
    #[must_use]
    pub fn contains_sid(&self, sid: &Sid) -> bool {
        self.sid_index.contains_key(sid)
    }

    /// The query the manager owning `sid` is probing for, if any.
    #[must_use]
    pub fn q_for_sid(&self, sid: &Sid) -> Option<Q> {
        self.sid_index.get(sid).copied()
    }

    /// The current `sid` registered for `q`'s manager, if one is
    /// registered and has probed at least once.
    #[must_use]
    pub fn current_sid_for(&self, q: &Q) -> Option<Sid> {
        self.managers.get(q).and_then(ProbeManager::current_sid)
    }

    /// Run one probe cycle for every registered manager.
    pub fn tick(&mut self, connections: &HashMap<overlay_proto::ids::Digest, LinkHandle>) {
        for manager in self.managers.values_mut() {
            let (sid, previous) = manager.probe(connections);
            if let Some(previous) = previous {
                self.sid_index.remove(&previous);
            }
            self.sid_index.insert(sid, manager.q());
        }
    }
}
