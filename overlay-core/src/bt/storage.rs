//! Piece storage: verifying and serving chunk reads/writes (§4.8).
//!
//! [`Storage`] is the abstract boundary a BT controller reads and
//! writes through. [`InMemoryStorage`] is the only required
//! implementation; a file-backed one would implement the same trait
//! without touching the rest of the BT tenant.

use std::collections::HashMap;

use sha1::{Digest as _, Sha1};

use super::{BtError, PieceId};

/// Static description of a torrent: its ordered piece hashes, the
/// nominal piece length, and the exact total content length (the last
/// piece is usually shorter than `piece_length`).
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Piece hashes in content order.
    pub piece_hashes: Vec<PieceId>,
    /// Length of every piece except possibly the last.
    pub piece_length: u32,
    /// Exact total content length.
    pub total_length: u64,
}

impl Metainfo {
    fn index_of(&self, piece: &PieceId) -> Option<usize> {
        self.piece_hashes.iter().position(|h| h == piece)
    }

    /// The exact length of `piece`, accounting for a short last piece.
    #[must_use]
    pub fn piece_len(&self, piece: &PieceId) -> Option<u32> {
        let index = self.index_of(piece)?;
        if index + 1 < self.piece_hashes.len() {
            return Some(self.piece_length);
        }
        let consumed = u64::from(self.piece_length) * index as u64;
        Some(u32::try_from(self.total_length.saturating_sub(consumed)).unwrap_or(self.piece_length))
    }

    /// The `(offset, length)` chunk boundaries covering `piece` at
    /// `chunk_size` granularity.
    #[must_use]
    pub fn chunks(&self, piece: &PieceId, chunk_size: u32) -> Vec<(u32, u32)> {
        let Some(len) = self.piece_len(piece) else { return Vec::new() };
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < len {
            let this_len = chunk_size.min(len - offset);
            out.push((offset, this_len));
            offset += this_len;
        }
        out
    }
}

/// Reads and writes verified piece content.
///
/// `check` is async so a file-backed implementation can verify
/// on-disk pieces without blocking the caller; [`InMemoryStorage`]
/// simply hashes its in-memory buffers.
pub trait Storage: Send {
    /// How many pieces are fully verified.
    fn get_number_completed(&self) -> usize;

    /// Every verified piece's hash.
    fn iter_completed(&self) -> Vec<PieceId>;

    /// Whether `piece` is fully verified.
    fn have(&self, piece: &PieceId) -> bool;

    /// Re-verify any not-yet-completed piece against its hash.
    ///
    /// # Errors
    ///
    /// Returns a [`BtError`] if the underlying storage can't be read.
    fn check(&mut self) -> impl std::future::Future<Output = Result<(), BtError>> + Send;

    /// Read `length` bytes from `piece` at `offset`, or `None` if out
    /// of range.
    fn read(&self, piece: &PieceId, offset: u32, length: u32) -> Option<Vec<u8>>;

    /// Write a chunk into `piece` at `offset`. Returns whether the
    /// piece is now fully verified.
    ///
    /// # Errors
    ///
    /// Returns a [`BtError`] if `piece` is unknown or the write falls
    /// outside its bounds.
    fn write(&mut self, piece: &PieceId, offset: u32, data: &[u8]) -> Result<bool, BtError>;
}

/// An in-memory [`Storage`] backed by one buffer per piece.
pub struct InMemoryStorage {
    metainfo: Metainfo,
    index: HashMap<PieceId, usize>,
    buffers: Vec<Vec<u8>>,
    completed: Vec<bool>,
}

impl InMemoryStorage {
    /// Allocate empty, unverified buffers for every piece in `metainfo`.
    #[must_use]
    pub fn new(metainfo: Metainfo) -> Self {
        let index = metainfo.piece_hashes.iter().enumerate().map(|(i, h)| (*h, i)).collect();
        let buffers = metainfo
            .piece_hashes
            .iter()
            .map(|h| vec![0u8; metainfo.piece_len(h).unwrap_or(0) as usize])
            .collect();
        let completed = vec![false; metainfo.piece_hashes.len()];
        Self { metainfo, index, buffers, completed }
    }

    fn verify(&self, index: usize) -> bool {
        let hash: [u8; 20] = Sha1::digest(&self.buffers[index]).into();
        hash == self.metainfo.piece_hashes[index]
    }
}

impl Storage for InMemoryStorage {
    fn get_number_completed(&self) -> usize {
        self.completed.iter().filter(|c| **c).count()
    }

    fn iter_completed(&self) -> Vec<PieceId> {
        self.completed
            .iter()
            .enumerate()
            .filter(|(_, c)| **c)
            .map(|(i, _)| self.metainfo.piece_hashes[i])
            .collect()
    }

    fn have(&self, piece: &PieceId) -> bool {
        self.index.get(piece).is_some_and(|&i| self.completed[i])
    }

    async fn check(&mut self) -> Result<(), BtError> {
        for i in 0..self.buffers.len() {
            if !self.completed[i] && self.verify(i) {
                self.completed[i] = true;
            }
        }
        Ok(())
    }

    fn read(&self, piece: &PieceId, offset: u32, length: u32) -> Option<Vec<u8>> {
        let &index = self.index.get(piece)?;
        let buffer = &self.buffers[index];
        let start = offset as usize;
        let end = start.checked_add(length as usize)?.min(buffer.len());
        if start > buffer.len() {
            return None;
        }
        Some(buffer[start..end].to_vec())
    }

    fn write(&mut self, piece: &PieceId, offset: u32, data: &[u8]) -> Result<bool, BtError> {
        let &index = self.index.get(piece).ok_or(BtError::UnknownPiece)?;
        let buffer = &mut self.buffers[index];
        let start = offset as usize;
        let end = start.checked_add(data.len()).ok_or(BtError::OutOfBounds)?;
        if end > buffer.len() {
            return Err(BtError::OutOfBounds);
        }
        buffer[start..end].copy_from_slice(data);
        let verified = self.verify(index);
        if verified {
            self.completed[index] = true;
        }
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(byte: u8, len: usize) -> (PieceId, Vec<u8>) {
        let content = vec![byte; len];
        let hash: [u8; 20] = Sha1::digest(&content).into();
        (hash, content)
    }

    #[test]
    fn write_completing_a_piece_reports_verified() {
        let (hash, content) = piece(7, 32);
        let metainfo = Metainfo { piece_hashes: vec![hash], piece_length: 32, total_length: 32 };
        let mut storage = InMemoryStorage::new(metainfo);
        assert!(!storage.have(&hash));
        let verified = storage.write(&hash, 0, &content).unwrap();
        assert!(verified);
        assert!(storage.have(&hash));
        assert_eq!(storage.get_number_completed(), 1);
    }

    #[test]
    fn partial_write_does_not_verify() {
        let (hash, content) = piece(3, 32);
        let metainfo = Metainfo { piece_hashes: vec![hash], piece_length: 32, total_length: 32 };
        let mut storage = InMemoryStorage::new(metainfo);
        let verified = storage.write(&hash, 0, &content[..16]).unwrap();
        assert!(!verified);
        assert!(!storage.have(&hash));
    }

    #[test]
    fn write_out_of_bounds_is_rejected() {
        let (hash, _) = piece(1, 16);
        let metainfo = Metainfo { piece_hashes: vec![hash], piece_length: 16, total_length: 16 };
        let mut storage = InMemoryStorage::new(metainfo);
        assert!(matches!(storage.write(&hash, 10, &[0u8; 10]), Err(BtError::OutOfBounds)));
    }

    #[test]
    fn write_unknown_piece_is_rejected() {
        let metainfo = Metainfo { piece_hashes: vec![], piece_length: 16, total_length: 0 };
        let mut storage = InMemoryStorage::new(metainfo);
        assert!(matches!(storage.write(&[0u8; 20], 0, &[]), Err(BtError::UnknownPiece)));
    }

    #[test]
    fn last_piece_length_accounts_for_remainder() {
        let (h1, _) = piece(1, 16);
        let (h2, _) = piece(2, 16);
        let metainfo = Metainfo { piece_hashes: vec![h1, h2], piece_length: 16, total_length: 24 };
        assert_eq!(metainfo.piece_len(&h1), Some(16));
        assert_eq!(metainfo.piece_len(&h2), Some(8));
    }

    #[test]
    fn chunks_cover_the_whole_piece() {
        let (hash, _) = piece(1, 40);
        let metainfo = Metainfo { piece_hashes: vec![hash], piece_length: 40, total_length: 40 };
        let chunks = metainfo.chunks(&hash, 16);
        assert_eq!(chunks, vec![(0, 16), (16, 16), (32, 8)]);
    }

    #[tokio::test]
    async fn check_verifies_pieces_written_directly_to_the_buffer() {
        let (hash, content) = piece(5, 16);
        let metainfo = Metainfo { piece_hashes: vec![hash], piece_length: 16, total_length: 16 };
        let mut storage = InMemoryStorage::new(metainfo);
        storage.buffers[0] = content;
        storage.check().await.unwrap();
        assert!(storage.have(&hash));
    }
}
