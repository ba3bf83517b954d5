//! Symmetric virtual-path routing index (§4.6).
//!
//! Each established path is stored as two entries, one per direction,
//! so a frame arriving on either side resolves to its partner in one
//! lookup. `get` "touches" both entries' timestamps together — from
//! either side's perspective the pair is equally fresh — so the
//! periodic [`Self::prune`] only ages out pairs nobody has used from
//! either end.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use overlay_proto::ids::{Digest, Pid};

use crate::link::LinkHandle;

use super::ControllerError;

struct RouteEntry {
    link: LinkHandle,
    pid: Pid,
    last_touched: Instant,
}

/// Maps `(link, pid)` to the partner `(link, pid)` it is spliced to.
#[derive(Default)]
pub struct RoutingTable {
    entries: HashMap<(Digest, Pid), RouteEntry>,
}

impl RoutingTable {
    /// An empty routing table.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Splice `(src, spid)` to `(tgt, tpid)`, both directions.
    pub fn add(&mut self, src: &LinkHandle, spid: Pid, tgt: &LinkHandle, tpid: Pid) {
        let now = Instant::now();
        self.entries.insert(
            (src.friend.digest, spid),
            RouteEntry { link: tgt.clone(), pid: tpid, last_touched: now },
        );
        self.entries.insert(
            (tgt.friend.digest, tpid),
            RouteEntry { link: src.clone(), pid: spid, last_touched: now },
        );
    }

    /// Resolve `(c, pid)` to its partner, refreshing both sides'
    /// timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::NoRoute`] if no pair is registered.
    pub fn get(&mut self, c: &Digest, pid: &Pid) -> Result<(LinkHandle, Pid), ControllerError> {
        let key = (*c, *pid);
        let (partner_digest, partner_pid, result) = {
            let entry = self.entries.get(&key).ok_or(ControllerError::NoRoute)?;
            (entry.link.friend.digest, entry.pid, (entry.link.clone(), entry.pid))
        };
        let now = Instant::now();
        if let Some(e) = self.entries.get_mut(&key) {
            e.last_touched = now;
        }
        if let Some(e) = self.entries.get_mut(&(partner_digest, partner_pid)) {
            e.last_touched = now;
        }
        Ok(result)
    }

    /// Remove `(c, pid)` and its partner, returning the partner.
    pub fn delete(&mut self, c: &Digest, pid: &Pid) -> Option<(LinkHandle, Pid)> {
        let entry = self.entries.remove(&(*c, *pid))?;
        self.entries.remove(&(entry.link.friend.digest, entry.pid));
        Some((entry.link, entry.pid))
    }

    /// Remove every pair touching `digest`'s link, from either side.
    pub fn connection_lost(&mut self, digest: &Digest) {
        let doomed: HashSet<(Digest, Pid)> = self
            .entries
            .iter()
            .filter(|(k, e)| &k.0 == digest || &e.link.friend.digest == digest)
            .map(|(k, _)| *k)
            .collect();
        for key in doomed {
            self.entries.remove(&key);
        }
    }

    /// Drop pairs whose timestamp is older than `interval`.
    pub fn prune(&mut self, interval: Duration) {
        let now = Instant::now();
        self.entries.retain(|_, e| now.duration_since(e.last_touched) < interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlay_proto::ids::ConnectionId;
    use tokio::sync::mpsc;

    fn link(byte: u8) -> LinkHandle {
        let friend = crate::friend::Friend::from_cert(vec![byte], None);
        let (tx, _rx) = mpsc::unbounded_channel();
        LinkHandle::new(friend, ConnectionId::random(), tx)
    }

    #[test]
    fn add_then_get_resolves_both_directions() {
        let mut t = RoutingTable::new();
        let a = link(1);
        let b = link(2);
        let pa = Pid::random();
        let pb = Pid::random();
        t.add(&a, pa, &b, pb);

        let (link_b, pid_b) = t.get(&a.friend.digest, &pa).unwrap();
        assert_eq!(link_b.friend.digest, b.friend.digest);
        assert_eq!(pid_b, pb);

        let (link_a, pid_a) = t.get(&b.friend.digest, &pb).unwrap();
        assert_eq!(link_a.friend.digest, a.friend.digest);
        assert_eq!(pid_a, pa);
    }

    #[test]
    fn get_missing_pair_fails() {
        let mut t = RoutingTable::new();
        assert!(matches!(t.get(&Digest::random(), &Pid::random()), Err(ControllerError::NoRoute)));
    }

    #[test]
    fn delete_removes_both_sides_and_returns_partner() {
        let mut t = RoutingTable::new();
        let a = link(1);
        let b = link(2);
        let pa = Pid::random();
        let pb = Pid::random();
        t.add(&a, pa, &b, pb);

        let (partner_link, partner_pid) = t.delete(&a.friend.digest, &pa).unwrap();
        assert_eq!(partner_link.friend.digest, b.friend.digest);
        assert_eq!(partner_pid, pb);
        assert!(t.get(&a.friend.digest, &pa).is_err());
        assert!(t.get(&b.friend.digest, &pb).is_err());
    }

    #[test]
    fn connection_lost_drops_every_pair_touching_the_link() {
        let mut t = RoutingTable::new();
        let a = link(1);
        let b = link(2);
        let pa = Pid::random();
        let pb = Pid::random();
        t.add(&a, pa, &b, pb);
        t.connection_lost(&a.friend.digest);
        assert!(t.get(&b.friend.digest, &pb).is_err());
    }

    #[test]
    fn prune_drops_stale_pairs() {
        let mut t = RoutingTable::new();
        let a = link(1);
        let b = link(2);
        t.add(&a, Pid::random(), &b, Pid::random());
        std::thread::sleep(Duration::from_millis(5));
        t.prune(Duration::from_millis(0));
        assert!(t.entries.is_empty());
    }
}
