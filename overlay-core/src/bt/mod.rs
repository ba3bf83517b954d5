//! BitTorrent-style piece-exchange tenant (§4.8).
//!
//! Runs as a [`crate::controller::transport::Protocol`] bound to one
//! virtual path per peer. A single [`controller::BtController`]
//! orchestrates every bound [`connection::Connection`] against one
//! shared [`picker::PiecePicker`], [`schedule::Schedule`], and
//! [`choker::Choker`], reading and writing through one [`storage::Storage`].
//!
//! Pieces are addressed by their content hash on the wire (there is no
//! numeric piece index in the sub-protocol), so [`PieceId`] is that
//! 20-byte hash throughout this module.

pub mod choker;
pub mod connection;
pub mod controller;
pub mod picker;
pub mod schedule;
pub mod storage;

use overlay_proto::ids::{Cid, Digest, Pid};

/// A piece's identity: the SHA-1 hash of its verified content.
pub type PieceId = [u8; 20];

/// Default request/chunk size: 16 KiB, the conventional BitTorrent
/// block size.
pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024;

/// Identifies one bound path: the friend it runs over plus its
/// `(pid, cid)`. `Address` itself isn't hashable, so this tuple stands
/// in as the connection key throughout the BT tenant.
pub type ConnId = (Digest, Pid, Cid);

/// Errors in the BT exchange tenant.
#[derive(Debug, thiserror::Error)]
pub enum BtError {
    /// A request or write referenced a piece not in this torrent's
    /// metainfo.
    #[error("unknown piece")]
    UnknownPiece,
    /// A write landed outside its piece's bounds.
    #[error("chunk write out of bounds")]
    OutOfBounds,
    /// A non-`HELLO` message arrived before the handshake completed;
    /// the connection is closed without further processing.
    #[error("message received before handshake completed")]
    HandshakeNotComplete,
    /// The peer sent a malformed BT message body.
    #[error(transparent)]
    Codec(#[from] overlay_proto::bt::BtCodecError),
}
