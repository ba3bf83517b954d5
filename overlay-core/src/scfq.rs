//! Self-Clocked Fair Queueing transmit scheduler (§4.2).
//!
//! One [`Scfq`] lives per link. It orders outbound frames across the
//! flows sharing that link — each flow is billed against its own
//! virtual finish time, so a flow pushing large or frequent frames
//! cannot starve the others. The `None` flow (locally originated
//! frames) is its own bucket, not a fairness bypass.

use std::collections::HashMap;
use std::hash::Hash;

/// A queued entry: its virtual finish time, insertion sequence (the
/// FIFO tiebreaker for entries that land on the same finish time),
/// the flow it is billed to, and the payload itself.
struct Entry<F> {
    finish: u64,
    seq: u64,
    flow: F,
    data: Vec<u8>,
}

/// Per-link fair queue keyed by an arbitrary hashable flow identifier.
///
/// `F` is typically `Option<Digest>`: `Some(friend)` for a frame
/// forwarded from an inbound link (billed to that link's flow), and
/// `None` for locally originated frames.
pub struct Scfq<F: Eq + Hash + Clone> {
    current_finish: u64,
    flow_finish: HashMap<F, u64>,
    weights: HashMap<F, f64>,
    queue: Vec<Entry<F>>,
    next_seq: u64,
}

impl<F: Eq + Hash + Clone> Default for Scfq<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Eq + Hash + Clone> Scfq<F> {
    /// Create an empty queue with `current_finish` at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current_finish: 0,
            flow_finish: HashMap::new(),
            weights: HashMap::new(),
            queue: Vec::new(),
            next_seq: 0,
        }
    }

    /// Override the weight of `flow`. Unset flows default to `1.0`.
    pub fn set_weight(&mut self, flow: F, weight: f64) {
        self.weights.insert(flow, weight);
    }

    fn weight(&self, flow: &F) -> f64 {
        self.weights.get(flow).copied().unwrap_or(1.0)
    }

    /// Whether the queue currently holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of entries currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue `data` under `flow`, computing its virtual finish time
    /// per §4.2's formula and inserting it right-of-equals among
    /// entries with the same finish time (stable FIFO for ties).
    pub fn enqueue(&mut self, flow: F, data: Vec<u8>) {
        let next_time = self.flow_finish.get(&flow).copied().unwrap_or(self.current_finish);
        let base = if next_time > self.current_finish {
            next_time
        } else {
            self.current_finish
        };
        let weight = self.weight(&flow);
        #[allow(clippy::cast_precision_loss)]
        let ratio = (data.len() as f64 / weight).floor();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let finish = base + ratio as u64;
        self.flow_finish.insert(flow.clone(), finish);

        let seq = self.next_seq;
        self.next_seq += 1;

        let idx = self.queue.partition_point(|e| e.finish <= finish);
        self.queue.insert(idx, Entry { finish, seq, flow, data });
    }

    /// Dequeue the entry with the lowest `(finish, seq)`, advancing
    /// `current_finish` to its finish time.
    pub fn dequeue(&mut self) -> Option<(F, Vec<u8>)> {
        if self.queue.is_empty() {
            return None;
        }
        let entry = self.queue.remove(0);
        self.current_finish = entry.finish;
        Some((entry.flow, entry.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_within_same_flow() {
        let mut q: Scfq<Option<u8>> = Scfq::new();
        q.enqueue(Some(1), vec![0u8; 10]);
        q.enqueue(Some(1), vec![0u8; 10]);
        q.enqueue(Some(1), vec![0u8; 10]);

        let (_, a) = q.dequeue().unwrap();
        let (_, b) = q.dequeue().unwrap();
        let (_, c) = q.dequeue().unwrap();
        assert_eq!((a.len(), b.len(), c.len()), (10, 10, 10));
        assert!(q.is_empty());
    }

    #[test]
    fn none_flow_is_its_own_bucket() {
        let mut q: Scfq<Option<u8>> = Scfq::new();
        q.enqueue(None, vec![0u8; 5]);
        q.enqueue(Some(1), vec![0u8; 5]);
        assert_eq!(q.len(), 2);
        let first = q.dequeue().unwrap().0;
        assert_eq!(first, None);
    }

    #[test]
    fn large_flow_does_not_starve_small_flow() {
        let mut q: Scfq<Option<u8>> = Scfq::new();
        // flow 1 bursts a lot of data first.
        for _ in 0..5 {
            q.enqueue(Some(1), vec![0u8; 1000]);
        }
        // flow 2 arrives after, with a single small entry.
        q.enqueue(Some(2), vec![0u8; 10]);

        // flow 2's entry should be served well before flow 1 drains,
        // because its virtual finish time is computed from
        // current_finish at enqueue time, not queue position.
        let mut order = Vec::new();
        while let Some((flow, _)) = q.dequeue() {
            order.push(flow);
        }
        let pos2 = order.iter().position(|f| *f == Some(2)).unwrap();
        assert!(pos2 < order.len() - 1, "flow 2 starved until the very end");
    }

    #[test]
    fn ties_preserve_insertion_order_across_flows() {
        let mut q: Scfq<Option<u8>> = Scfq::new();
        // Both land at the same finish time (0 bytes ⇒ ratio 0) since
        // current_finish starts at 0 for both flows.
        q.enqueue(Some(1), vec![]);
        q.enqueue(Some(2), vec![]);
        assert_eq!(q.dequeue().unwrap().0, Some(1));
        assert_eq!(q.dequeue().unwrap().0, Some(2));
    }

    #[test]
    fn custom_weight_shortens_effective_finish_time() {
        let mut q: Scfq<Option<u8>> = Scfq::new();
        q.set_weight(Some(1), 2.0);
        q.enqueue(Some(1), vec![0u8; 100]); // ratio = 50
        q.enqueue(Some(2), vec![0u8; 60]); // ratio = 60, weight 1
        assert_eq!(q.dequeue().unwrap().0, Some(1));
    }

    proptest::proptest! {
        /// Whatever mix of flows and frame sizes is enqueued, dequeue
        /// order never regresses `current_finish`: each drained entry's
        /// finish time is at least as large as the one before it.
        #[test]
        fn dequeue_order_is_monotonic_in_finish_time(
            entries in proptest::collection::vec((0u8..4, 0usize..2000), 1..50),
        ) {
            let mut q: Scfq<u8> = Scfq::new();
            for (flow, size) in entries {
                q.enqueue(flow, vec![0u8; size]);
            }
            let mut last = 0u64;
            while let Some(_) = q.dequeue() {
                proptest::prop_assert!(q.current_finish >= last);
                last = q.current_finish;
            }
        }
    }
}
