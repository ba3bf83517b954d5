//! Rarest-first piece selection with fixed-piece continuity (§4.8).
//!
//! Pieces we've never heard a `HAVE` for sit at level 0 and are never
//! offered — there's no point requesting a piece nobody is known to
//! hold. Every `HAVE` bumps a piece's level; losing the only holder of
//! a piece drops it back down. A piece already in progress (we've
//! received at least one chunk of it) is "fixed": it stays at the
//! front of the iteration order so a connection keeps finishing what
//! it started instead of spreading requests thin across many pieces.

use std::collections::{HashMap, VecDeque};

use rand::Rng;

use super::PieceId;

/// Tracks interest levels and in-progress continuity across every
/// piece this node doesn't yet hold.
#[derive(Default)]
pub struct PiecePicker {
    /// `interests[k]` holds every tracked piece known to have exactly
    /// `k` holders. Level 0 means "not yet confirmed held by anyone".
    interests: Vec<Vec<PieceId>>,
    levels: HashMap<PieceId, usize>,
    /// Pieces with at least one chunk already received, in the order
    /// they were first touched.
    fixed: VecDeque<PieceId>,
}

impl PiecePicker {
    /// Start tracking every piece in `not_held` at level 0.
    #[must_use]
    pub fn new(not_held: Vec<PieceId>) -> Self {
        let levels = not_held.iter().map(|p| (*p, 0)).collect();
        Self { interests: vec![not_held], levels, fixed: VecDeque::new() }
    }

    fn remove_from_level(&mut self, piece: &PieceId, level: usize) {
        if let Some(bucket) = self.interests.get_mut(level) {
            bucket.retain(|p| p != piece);
        }
    }

    /// A peer advertised holding `piece`; bump its level.
    pub fn got_have(&mut self, piece: PieceId) {
        let Some(&level) = self.levels.get(&piece) else { return };
        self.remove_from_level(&piece, level);
        let new_level = level + 1;
        if self.interests.len() <= new_level {
            self.interests.resize(new_level + 1, Vec::new());
        }
        self.interests[new_level].push(piece);
        self.levels.insert(piece, new_level);
    }

    /// The only peer holding `piece` disconnected; drop its level.
    pub fn lost_have(&mut self, piece: PieceId) {
        let Some(&level) = self.levels.get(&piece) else { return };
        if level == 0 {
            return;
        }
        self.remove_from_level(&piece, level);
        let new_level = level - 1;
        self.interests[new_level].push(piece);
        self.levels.insert(piece, new_level);
    }

    /// A chunk of `piece` arrived; pin it to the front of the order.
    pub fn chunk_received(&mut self, piece: PieceId) {
        if !self.fixed.contains(&piece) {
            self.fixed.push_back(piece);
        }
    }

    /// `piece` fully verified; stop tracking it entirely.
    pub fn complete(&mut self, piece: PieceId) {
        self.fixed.retain(|p| p != &piece);
        if let Some(level) = self.levels.remove(&piece) {
            self.remove_from_level(&piece, level);
        }
    }

    /// Iteration order: fixed pieces first (in fixed order), then
    /// every known-held piece (levels 1 and up) in random order.
    #[must_use]
    pub fn iter(&self) -> Vec<PieceId> {
        let mut rest: Vec<PieceId> = self
            .interests
            .iter()
            .skip(1)
            .flatten()
            .copied()
            .filter(|p| !self.fixed.contains(p))
            .collect();
        let mut rng = rand::rng();
        for i in (1..rest.len()).rev() {
            let j = rng.random_range(0..=i);
            rest.swap(i, j);
        }
        let mut out: Vec<PieceId> = self.fixed.iter().copied().collect();
        out.extend(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(byte: u8) -> PieceId {
        [byte; 20]
    }

    #[test]
    fn untouched_pieces_are_never_offered() {
        let picker = PiecePicker::new(vec![p(1), p(2)]);
        assert!(picker.iter().is_empty());
    }

    #[test]
    fn got_have_makes_a_piece_eligible() {
        let mut picker = PiecePicker::new(vec![p(1), p(2)]);
        picker.got_have(p(1));
        assert_eq!(picker.iter(), vec![p(1)]);
    }

    #[test]
    fn lost_have_drops_below_eligible_again() {
        let mut picker = PiecePicker::new(vec![p(1)]);
        picker.got_have(p(1));
        picker.lost_have(p(1));
        assert!(picker.iter().is_empty());
    }

    #[test]
    fn fixed_pieces_come_first_and_stay_put() {
        let mut picker = PiecePicker::new(vec![p(1), p(2), p(3)]);
        picker.got_have(p(1));
        picker.got_have(p(2));
        picker.got_have(p(3));
        picker.chunk_received(p(2));
        let order = picker.iter();
        assert_eq!(order[0], p(2));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn complete_stops_tracking_the_piece() {
        let mut picker = PiecePicker::new(vec![p(1)]);
        picker.got_have(p(1));
        picker.chunk_received(p(1));
        picker.complete(p(1));
        assert!(picker.iter().is_empty());
    }
}
