//! Per-node probe deduplication index (§4.6).
//!
//! Every `PROBE` this node relays (not originates) registers its `sid`
//! here, bound to the inbound link it arrived on. A second `PROBE`
//! carrying the same `sid` is a duplicate flood and is dropped rather
//! than relayed again; `connection_lost` and the periodic `prune` keep
//! the index from growing without bound.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use overlay_proto::ids::{Digest, Sid};

use crate::link::LinkHandle;

use super::ControllerError;

/// Deduplicates in-flight probes by session id.
pub struct ProbeTable {
    interval: Duration,
    by_sid: HashMap<Sid, LinkHandle>,
    by_link: HashMap<Digest, HashSet<Sid>>,
    order: VecDeque<(Sid, Instant)>,
}

impl ProbeTable {
    /// Build a probe table that prunes entries older than `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            by_sid: HashMap::new(),
            by_link: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Register `sid` as arriving on `link`.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::DuplicateProbe`] if `sid` is already
    /// registered.
    pub fn add(&mut self, sid: Sid, link: LinkHandle) -> Result<(), ControllerError> {
        if self.by_sid.contains_key(&sid) {
            return Err(ControllerError::DuplicateProbe);
        }
        self.by_link.entry(link.friend.digest).or_default().insert(sid);
        self.by_sid.insert(sid, link);
        self.order.push_back((sid, Instant::now()));
        Ok(())
    }

    /// Look up the inbound link that registered `sid`.
    #[must_use]
    pub fn get(&self, sid: &Sid) -> Option<&LinkHandle> {
        self.by_sid.get(sid)
    }

    /// Drop every `sid` registered against `digest`'s link.
    pub fn connection_lost(&mut self, digest: &Digest) {
        if let Some(sids) = self.by_link.remove(digest) {
            for sid in sids {
                self.by_sid.remove(&sid);
            }
        }
    }

    /// Drop entries older than `interval`, scanning the insertion-order
    /// list from the head. Entries already removed by
    /// [`Self::connection_lost`] are tolerated as stale head entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        while let Some(&(sid, inserted_at)) = self.order.front() {
            if now.duration_since(inserted_at) < self.interval {
                break;
            }
            self.order.pop_front();
            if let Some(link) = self.by_sid.remove(&sid) {
                if let Some(set) = self.by_link.get_mut(&link.friend.digest) {
                    set.remove(&sid);
                    if set.is_empty() {
                        self.by_link.remove(&link.friend.digest);
                    }
                }
            }
        }
    }
}
