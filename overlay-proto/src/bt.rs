//! Wire messages for the BitTorrent-style piece-exchange sub-protocol.
//!
//! These opcodes occupy the application range (`>= 128`) of the outer
//! overlay frame (§4.1): the BT opcode byte *is* the app-message opcode
//! carried directly in a [`crate::message::Frame::App`], there is no
//! additional framing layer underneath it.

/// Empty handshake message, sent once a path is bound.
pub const OP_HELLO: u8 = 0x80;
/// Stop sending chunk requests to us.
pub const OP_CHOKE: u8 = 0x81;
/// Resume sending chunk requests to us.
pub const OP_UNCHOKE: u8 = 0x82;
/// We are interested in pieces the peer holds.
pub const OP_INTERESTED: u8 = 0x83;
/// We are no longer interested in anything the peer holds.
pub const OP_NOT_INTERESTED: u8 = 0x84;
/// Advertise one or more newly completed pieces (20-byte hashes).
pub const OP_HAVE: u8 = 0x85;
/// Advertise that we hold nothing.
pub const OP_HAVE_NONE: u8 = 0x86;
/// Advertise that we hold every piece.
pub const OP_HAVE_ALL: u8 = 0x87;
/// Reserved; never sent. Receiving it is a protocol error.
pub const OP_HAVE_SOME: u8 = 0x88;
/// Request a chunk of a piece.
pub const OP_REQUEST: u8 = 0x89;
/// Refuse a previously issued request.
pub const OP_REJECT: u8 = 0x8a;
/// Withdraw a previously issued request.
pub const OP_CANCEL: u8 = 0x8b;
/// Chunk payload satisfying a request.
pub const OP_CHUNK: u8 = 0x8c;

const HASH_LEN: usize = 20;

/// A decoded BT sub-protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtMessage {
    /// Empty handshake payload.
    Hello,
    /// Stop accepting our requests.
    Choke,
    /// Resume accepting our requests.
    Unchoke,
    /// We want something the peer has.
    Interested,
    /// We want nothing the peer has.
    NotInterested,
    /// One or more newly completed piece hashes.
    Have(Vec<[u8; HASH_LEN]>),
    /// The peer holds nothing.
    HaveNone,
    /// The peer holds everything.
    HaveAll,
    /// `(piece_hash, offset, length)` — a chunk request.
    Request([u8; HASH_LEN], u32, u32),
    /// `(piece_hash, offset, length)` — a rejected request.
    Reject([u8; HASH_LEN], u32, u32),
    /// `(piece_hash, offset, length)` — a withdrawn request.
    Cancel([u8; HASH_LEN], u32, u32),
    /// `(piece_hash, offset, data)` — chunk payload.
    Chunk([u8; HASH_LEN], u32, Vec<u8>),
}

/// Errors decoding a BT sub-protocol message body.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BtCodecError {
    /// The body length didn't match what this opcode requires.
    #[error("bt opcode 0x{opcode:02x} expects at least {expected} bytes, got {actual}")]
    Truncated {
        /// Offending opcode.
        opcode: u8,
        /// Minimum bytes required.
        expected: usize,
        /// Bytes actually present.
        actual: usize,
    },
    /// `HAVE`'s body wasn't a whole number of 20-byte hashes.
    #[error("HAVE body length {0} is not a multiple of 20")]
    MisalignedHave(usize),
    /// `HAVE_SOME` was received; it is reserved and never sent.
    #[error("received reserved HAVE_SOME opcode")]
    ReservedHaveSome,
    /// An opcode outside the known BT range was received.
    #[error("unknown bt opcode 0x{0:02x}")]
    UnknownOpcode(u8),
}

impl BtMessage {
    /// The BT opcode identifying this message's shape.
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        match self {
            Self::Hello => OP_HELLO,
            Self::Choke => OP_CHOKE,
            Self::Unchoke => OP_UNCHOKE,
            Self::Interested => OP_INTERESTED,
            Self::NotInterested => OP_NOT_INTERESTED,
            Self::Have(_) => OP_HAVE,
            Self::HaveNone => OP_HAVE_NONE,
            Self::HaveAll => OP_HAVE_ALL,
            Self::Request(..) => OP_REQUEST,
            Self::Reject(..) => OP_REJECT,
            Self::Cancel(..) => OP_CANCEL,
            Self::Chunk(..) => OP_CHUNK,
        }
    }

    /// Encode this message's body (the part after the opcode byte,
    /// which the caller wraps in an overlay [`crate::message::Frame::App`]).
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        match self {
            Self::Hello | Self::Choke | Self::Unchoke | Self::Interested | Self::NotInterested
            | Self::HaveNone | Self::HaveAll => Vec::new(),
            Self::Have(hashes) => hashes.iter().flatten().copied().collect(),
            Self::Request(hash, offset, length) | Self::Reject(hash, offset, length) | Self::Cancel(hash, offset, length) => {
                let mut body = Vec::with_capacity(HASH_LEN + 8);
                body.extend_from_slice(hash);
                body.extend_from_slice(&offset.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
                body
            }
            Self::Chunk(hash, offset, data) => {
                let mut body = Vec::with_capacity(HASH_LEN + 4 + data.len());
                body.extend_from_slice(hash);
                body.extend_from_slice(&offset.to_be_bytes());
                body.extend_from_slice(data);
                body
            }
        }
    }

    /// Decode a message body given its BT opcode.
    ///
    /// # Errors
    ///
    /// Returns a [`BtCodecError`] if the body is too short, misaligned,
    /// reserved, or the opcode is unrecognized.
    pub fn decode(opcode: u8, body: &[u8]) -> Result<Self, BtCodecError> {
        fn request_tuple(opcode: u8, body: &[u8]) -> Result<([u8; HASH_LEN], u32, u32), BtCodecError> {
            const LEN: usize = HASH_LEN + 8;
            if body.len() != LEN {
                return Err(BtCodecError::Truncated {
                    opcode,
                    expected: LEN,
                    actual: body.len(),
                });
            }
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(&body[..HASH_LEN]);
            let offset = u32::from_be_bytes(body[HASH_LEN..HASH_LEN + 4].try_into().unwrap_or_default());
            let length = u32::from_be_bytes(body[HASH_LEN + 4..HASH_LEN + 8].try_into().unwrap_or_default());
            Ok((hash, offset, length))
        }

        match opcode {
            OP_HELLO => Ok(Self::Hello),
            OP_CHOKE => Ok(Self::Choke),
            OP_UNCHOKE => Ok(Self::Unchoke),
            OP_INTERESTED => Ok(Self::Interested),
            OP_NOT_INTERESTED => Ok(Self::NotInterested),
            OP_HAVE_NONE => Ok(Self::HaveNone),
            OP_HAVE_ALL => Ok(Self::HaveAll),
            OP_HAVE_SOME => Err(BtCodecError::ReservedHaveSome),
            OP_HAVE => {
                if body.len() % HASH_LEN != 0 {
                    return Err(BtCodecError::MisalignedHave(body.len()));
                }
                let hashes = body
                    .chunks_exact(HASH_LEN)
                    .map(|chunk| {
                        let mut hash = [0u8; HASH_LEN];
                        hash.copy_from_slice(chunk);
                        hash
                    })
                    .collect();
                Ok(Self::Have(hashes))
            }
            OP_REQUEST => {
                let (hash, offset, length) = request_tuple(opcode, body)?;
                Ok(Self::Request(hash, offset, length))
            }
            OP_REJECT => {
                let (hash, offset, length) = request_tuple(opcode, body)?;
                Ok(Self::Reject(hash, offset, length))
            }
            OP_CANCEL => {
                let (hash, offset, length) = request_tuple(opcode, body)?;
                Ok(Self::Cancel(hash, offset, length))
            }
            OP_CHUNK => {
                if body.len() < HASH_LEN + 4 {
                    return Err(BtCodecError::Truncated {
                        opcode,
                        expected: HASH_LEN + 4,
                        actual: body.len(),
                    });
                }
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(&body[..HASH_LEN]);
                let offset = u32::from_be_bytes(body[HASH_LEN..HASH_LEN + 4].try_into().unwrap_or_default());
                let data = body[HASH_LEN + 4..].to_vec();
                Ok(Self::Chunk(hash, offset, data))
            }
            other => Err(BtCodecError::UnknownOpcode(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips() {
        let body = BtMessage::Hello.encode_body();
        assert!(body.is_empty());
        assert_eq!(BtMessage::decode(OP_HELLO, &body).unwrap(), BtMessage::Hello);
    }

    #[test]
    fn have_round_trips_multiple_hashes() {
        let msg = BtMessage::Have(vec![[1u8; HASH_LEN], [2u8; HASH_LEN]]);
        let body = msg.encode_body();
        assert_eq!(body.len(), HASH_LEN * 2);
        assert_eq!(BtMessage::decode(OP_HAVE, &body).unwrap(), msg);
    }

    #[test]
    fn have_rejects_misaligned_body() {
        let err = BtMessage::decode(OP_HAVE, &[0u8; 7]).unwrap_err();
        assert_eq!(err, BtCodecError::MisalignedHave(7));
    }

    #[test]
    fn request_round_trips() {
        let msg = BtMessage::Request([9u8; HASH_LEN], 1024, 16384);
        let body = msg.encode_body();
        assert_eq!(BtMessage::decode(OP_REQUEST, &body).unwrap(), msg);
    }

    #[test]
    fn chunk_round_trips_with_data() {
        let msg = BtMessage::Chunk([7u8; HASH_LEN], 0, vec![0xaa; 100]);
        let body = msg.encode_body();
        assert_eq!(BtMessage::decode(OP_CHUNK, &body).unwrap(), msg);
    }

    #[test]
    fn have_some_is_rejected() {
        assert_eq!(
            BtMessage::decode(OP_HAVE_SOME, &[]).unwrap_err(),
            BtCodecError::ReservedHaveSome
        );
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert_eq!(
            BtMessage::decode(0xff, &[]).unwrap_err(),
            BtCodecError::UnknownOpcode(0xff)
        );
    }
}
