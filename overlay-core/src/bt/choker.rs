//! Upload slot allocation across connections sharing one torrent (§4.8).
//!
//! [`Choker`] owns only the connection ordering and the choke/unchoke
//! decisions; it never touches connections directly. The controller
//! hands it a view of every connection through [`ChokeTarget`] at tick
//! time and applies whatever the choker decides.

use std::collections::{HashMap, HashSet};

use overlay_proto::ids::Digest;
use rand::Rng;

use super::ConnId;

const DEFAULT_MAX_UPLOADS: usize = 4;

/// What the choker needs to know about, and do to, one connection.
pub trait ChokeTarget {
    /// Whether the remote end is interested in pieces we hold.
    fn is_interested(&self) -> bool;
    /// Whether we are currently choking this connection.
    fn is_choking(&self) -> bool;
    /// Recent download rate from this connection, used to rank upload
    /// candidates (faster downloaders get reciprocated first).
    fn download_rate(&self) -> f64;
    /// Toggle whether we choke this connection, sending `CHOKE`/`UNCHOKE`
    /// if the state actually changes.
    fn set_choking(&mut self, choking: bool);
}

/// Decides which connections get an upload slot.
pub struct Choker {
    max_uploads: usize,
    order: Vec<ConnId>,
}

impl Choker {
    /// A choker allowing up to `max_uploads` simultaneous unchoked
    /// connections.
    #[must_use]
    pub fn new(max_uploads: usize) -> Self {
        Self { max_uploads, order: Vec::new() }
    }

    /// The default upload slot count.
    #[must_use]
    pub fn default_max_uploads() -> usize {
        DEFAULT_MAX_UPLOADS
    }

    /// Register a new connection at a randomized position, so a fresh
    /// peer isn't always last in line for a slot.
    pub fn connection_made(&mut self, id: ConnId) {
        let len = self.order.len();
        let index = if len == 0 {
            0
        } else {
            let raw: i64 = rand::rng().random_range(-2..=len as i64);
            raw.clamp(0, len as i64) as usize
        };
        self.order.insert(index, id);
    }

    /// Forget a connection entirely.
    pub fn connection_lost(&mut self, id: &ConnId) {
        self.order.retain(|c| c != id);
    }

    /// Rotate one choked, interested connection to the front so the
    /// next [`Self::rechoke`] gives it a fair shot at a slot.
    pub fn optimistic_unchoke(&mut self, targets: &HashMap<ConnId, &mut dyn ChokeTarget>) {
        let pos = self
            .order
            .iter()
            .position(|id| targets.get(id).is_some_and(|t| t.is_choking() && t.is_interested()));
        if let Some(pos) = pos {
            let id = self.order.remove(pos);
            self.order.insert(0, id);
        }
    }

    /// Reassign upload slots: the fastest-downloading interested
    /// connections (up to `max_uploads - 1`) plus whichever others fit
    /// within the remaining slot, in order, get unchoked.
    pub fn rechoke(&mut self, targets: &mut HashMap<ConnId, &mut dyn ChokeTarget>) {
        let mut interested: Vec<ConnId> = self
            .order
            .iter()
            .copied()
            .filter(|id| targets.get(id).is_some_and(|t| t.is_interested()))
            .collect();
        interested.sort_by(|a, b| {
            let rate_a = targets.get(a).map_or(0.0, |t| t.download_rate());
            let rate_b = targets.get(b).map_or(0.0, |t| t.download_rate());
            rate_b.partial_cmp(&rate_a).unwrap_or(std::cmp::Ordering::Equal)
        });
        let preferred: HashSet<ConnId> =
            interested.iter().take(self.max_uploads.saturating_sub(1)).copied().collect();

        let mut unchoked = 0;
        for id in &self.order {
            let Some(target) = targets.get_mut(id) else { continue };
            if preferred.contains(id) || unchoked < self.max_uploads {
                target.set_choking(false);
                if target.is_interested() {
                    unchoked += 1;
                }
            } else {
                target.set_choking(true);
            }
        }
    }
}
