//! Outstanding chunk-request bookkeeping, shared across every
//! connection working on the same torrent (§4.8).
//!
//! A chunk moves `pending -> active` when handed to a connection via
//! [`Schedule::get_request`], back to `pending` if the connection
//! can't use it ([`Schedule::put_request`]), and out of `active`
//! entirely once satisfied ([`Schedule::honor_request`]).

use std::collections::{HashMap, VecDeque};

use super::storage::{Metainfo, Storage};
use super::PieceId;

type Chunk = (u32, u32);

/// Tracks which chunks of each not-yet-held piece are unrequested,
/// requested, or satisfied.
#[derive(Default)]
pub struct Schedule {
    pending: HashMap<PieceId, VecDeque<Chunk>>,
    active: HashMap<PieceId, Vec<Chunk>>,
}

impl Schedule {
    /// Populate pending chunk lists for every piece `storage` doesn't
    /// yet hold.
    #[must_use]
    pub fn new<S: Storage>(metainfo: &Metainfo, storage: &S, chunk_size: u32) -> Self {
        let mut pending = HashMap::new();
        for piece in &metainfo.piece_hashes {
            if storage.have(piece) {
                continue;
            }
            let chunks: VecDeque<Chunk> = metainfo.chunks(piece, chunk_size).into_iter().collect();
            pending.insert(*piece, chunks);
        }
        Self { pending, active: HashMap::new() }
    }

    /// Pop the next unrequested chunk of `piece`, moving it to active.
    pub fn get_request(&mut self, piece: &PieceId) -> Option<Chunk> {
        let queue = self.pending.get_mut(piece)?;
        let chunk = queue.pop_front()?;
        self.active.entry(*piece).or_default().push(chunk);
        Some(chunk)
    }

    /// A request was satisfied (chunk received or piece already
    /// complete); drop it from active bookkeeping.
    pub fn honor_request(&mut self, piece: &PieceId, offset: u32, length: u32) {
        if let Some(active) = self.active.get_mut(piece) {
            active.retain(|&(o, l)| (o, l) != (offset, length));
        }
    }

    /// A request couldn't be used (rejected, connection lost, or
    /// withdrawn); move it back to pending. Returns whether `piece`
    /// already had other pending requests before this one was
    /// returned (signals the piece is still of active interest).
    pub fn put_request(&mut self, piece: &PieceId, offset: u32, length: u32) -> bool {
        if let Some(active) = self.active.get_mut(piece) {
            active.retain(|&(o, l)| (o, l) != (offset, length));
        }
        let queue = self.pending.entry(*piece).or_default();
        let was_interesting = !queue.is_empty();
        queue.push_back((offset, length));
        was_interesting
    }

    /// Whether `piece` still has unrequested chunks.
    #[must_use]
    pub fn have_requests(&self, piece: &PieceId) -> bool {
        self.pending.get(piece).is_some_and(|q| !q.is_empty())
    }

    /// `piece` fully verified; forget it entirely.
    pub fn complete(&mut self, piece: &PieceId) {
        self.pending.remove(piece);
        self.active.remove(piece);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bt::storage::InMemoryStorage;

    fn metainfo() -> Metainfo {
        Metainfo { piece_hashes: vec![[1u8; 20], [2u8; 20]], piece_length: 32, total_length: 64 }
    }

    #[test]
    fn new_populates_chunks_for_pieces_not_held() {
        let mi = metainfo();
        let storage = InMemoryStorage::new(mi.clone());
        let schedule = Schedule::new(&mi, &storage, 16);
        assert!(schedule.have_requests(&[1u8; 20]));
        assert!(schedule.have_requests(&[2u8; 20]));
    }

    #[test]
    fn get_request_moves_chunk_to_active() {
        let mi = metainfo();
        let storage = InMemoryStorage::new(mi.clone());
        let mut schedule = Schedule::new(&mi, &storage, 16);
        let first = schedule.get_request(&[1u8; 20]).unwrap();
        assert_eq!(first, (0, 16));
    }

    #[test]
    fn put_request_returns_chunk_and_reports_prior_interest() {
        let mi = metainfo();
        let storage = InMemoryStorage::new(mi.clone());
        let mut schedule = Schedule::new(&mi, &storage, 16);
        let (offset, length) = schedule.get_request(&[1u8; 20]).unwrap();
        let still_interesting = schedule.put_request(&[1u8; 20], offset, length);
        assert!(still_interesting);
        assert!(schedule.have_requests(&[1u8; 20]));
    }

    #[test]
    fn honor_request_drops_from_active_without_requeueing() {
        let mi = metainfo();
        let storage = InMemoryStorage::new(mi.clone());
        let mut schedule = Schedule::new(&mi, &storage, 16);
        let (offset, length) = schedule.get_request(&[1u8; 20]).unwrap();
        schedule.honor_request(&[1u8; 20], offset, length);
        assert!(schedule.have_requests(&[1u8; 20]));
        assert_ne!(schedule.get_request(&[1u8; 20]).unwrap(), (offset, length));
    }

    #[test]
    fn complete_forgets_the_piece() {
        let mi = metainfo();
        let storage = InMemoryStorage::new(mi.clone());
        let mut schedule = Schedule::new(&mi, &storage, 16);
        schedule.complete(&[1u8; 20]);
        assert!(!schedule.have_requests(&[1u8; 20]));
    }
}
