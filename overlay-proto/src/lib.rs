//! Wire protocol definitions for the friend-to-friend overlay network:
//! fixed-width identifiers, the framed control/application codec, and
//! the BitTorrent-style exchange's sub-protocol messages.

pub mod bt;
pub mod codec;
pub mod ids;
pub mod message;
