//! Frame codec for the overlay wire protocol.
//!
//! Wire format per message: one byte `opcode`, three bytes big-endian
//! `length` (payload length, at most 2^24 - 1), then `length` bytes of
//! payload. Opcodes 0-127 are overlay control (`PROBE`/`ESTABLISH`/
//! `RESET`); 128-255 are opaque application payloads. Truncated or
//! malformed frames are a hard error that terminates the link — this
//! codec never attempts partial recovery.

use crate::ids::{Cid, Pid, Q, Sid, ID_LEN};
use crate::message::{Frame, OP_ESTABLISH, OP_PROBE, OP_RESET, is_app_opcode};

/// Header size: one opcode byte plus a 3-byte big-endian length.
const HEADER_LEN: usize = 4;

/// Largest payload length representable in the 3-byte length field.
const MAX_PAYLOAD_LEN: usize = (1 << 24) - 1;

/// Errors decoding a frame from the wire.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// The declared payload length exceeds what a 3-byte field can hold,
    /// or an outbound payload is too large to frame.
    #[error("payload length {0} exceeds the 3-byte length field")]
    PayloadTooLarge(usize),
    /// A control payload had the wrong length for its opcode.
    #[error("opcode {opcode} expects a {expected}-byte payload, got {actual}")]
    BadControlPayload {
        /// The opcode whose payload was malformed.
        opcode: u8,
        /// The length this opcode's payload must have.
        expected: usize,
        /// The length actually present.
        actual: usize,
    },
}

/// Encode a [`Frame`] into its wire representation.
///
/// # Errors
///
/// Returns [`CodecError::PayloadTooLarge`] if an application payload
/// exceeds the 3-byte length field's range.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let opcode = frame.opcode();
    let mut payload = Vec::new();
    match frame {
        Frame::Probe { q, cid, sid, ttl } => {
            payload.extend_from_slice(q.as_bytes());
            payload.extend_from_slice(cid.as_bytes());
            payload.extend_from_slice(sid.as_bytes());
            payload.extend_from_slice(&[0u8; 3]);
            payload.push(*ttl);
        }
        Frame::Establish { pid, cid, sid } => {
            payload.extend_from_slice(pid.as_bytes());
            payload.extend_from_slice(cid.as_bytes());
            payload.extend_from_slice(sid.as_bytes());
        }
        Frame::Reset { pid, cid } => {
            payload.extend_from_slice(pid.as_bytes());
            payload.extend_from_slice(cid.as_bytes());
        }
        Frame::App { pid, cid, body, .. } => {
            payload.extend_from_slice(pid.as_bytes());
            payload.extend_from_slice(cid.as_bytes());
            payload.extend_from_slice(body);
        }
    }

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let mut frame_bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    frame_bytes.push(opcode);
    let len = payload.len() as u32;
    frame_bytes.push(((len >> 16) & 0xff) as u8);
    frame_bytes.push(((len >> 8) & 0xff) as u8);
    frame_bytes.push((len & 0xff) as u8);
    frame_bytes.extend_from_slice(&payload);
    Ok(frame_bytes)
}

/// Parse a single frame's payload (opcode already stripped) into a
/// [`Frame`].
///
/// # Errors
///
/// Returns [`CodecError::BadControlPayload`] if a control opcode's
/// payload doesn't match its fixed length.
fn parse_payload(opcode: u8, payload: &[u8]) -> Result<Frame, CodecError> {
    fn field(payload: &[u8], offset: usize) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&payload[offset..offset + ID_LEN]);
        out
    }

    match opcode {
        OP_PROBE => {
            const EXPECTED: usize = ID_LEN * 3 + 3 + 1;
            if payload.len() != EXPECTED {
                return Err(CodecError::BadControlPayload {
                    opcode,
                    expected: EXPECTED,
                    actual: payload.len(),
                });
            }
            Ok(Frame::Probe {
                q: Q::new(field(payload, 0)),
                cid: Cid::new(field(payload, ID_LEN)),
                sid: Sid::new(field(payload, ID_LEN * 2)),
                ttl: payload[ID_LEN * 3 + 3],
            })
        }
        OP_ESTABLISH => {
            const EXPECTED: usize = ID_LEN * 3;
            if payload.len() != EXPECTED {
                return Err(CodecError::BadControlPayload {
                    opcode,
                    expected: EXPECTED,
                    actual: payload.len(),
                });
            }
            Ok(Frame::Establish {
                pid: Pid::new(field(payload, 0)),
                cid: Cid::new(field(payload, ID_LEN)),
                sid: Sid::new(field(payload, ID_LEN * 2)),
            })
        }
        OP_RESET => {
            const EXPECTED: usize = ID_LEN * 2;
            if payload.len() != EXPECTED {
                return Err(CodecError::BadControlPayload {
                    opcode,
                    expected: EXPECTED,
                    actual: payload.len(),
                });
            }
            Ok(Frame::Reset {
                pid: Pid::new(field(payload, 0)),
                cid: Cid::new(field(payload, ID_LEN)),
            })
        }
        op if is_app_opcode(op) => {
            if payload.len() < ID_LEN * 2 {
                return Err(CodecError::BadControlPayload {
                    opcode,
                    expected: ID_LEN * 2,
                    actual: payload.len(),
                });
            }
            Ok(Frame::App {
                pid: Pid::new(field(payload, 0)),
                cid: Cid::new(field(payload, ID_LEN)),
                opcode,
                body: payload[ID_LEN * 2..].to_vec(),
            })
        }
        _ => Err(CodecError::BadControlPayload {
            opcode,
            expected: 0,
            actual: payload.len(),
        }),
    }
}

/// Incremental frame decoder over an accumulating receive buffer.
///
/// Bytes arrive from the transport in arbitrary chunks; [`push`] appends
/// them, and [`next_frame`] drains at most one complete frame once the
/// buffer holds `HEADER_LEN + length` bytes, removing the consumed
/// prefix. A malformed frame is a terminal error for the caller: the
/// reference behavior is to close the link, not to attempt resync.
///
/// [`push`]: Decoder::push
/// [`next_frame`]: Decoder::next_frame
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append freshly read bytes to the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempt to decode one complete frame from the buffer.
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold a full frame.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the declared length is unrepresentable
    /// or a control opcode's payload has the wrong length. Callers must
    /// treat this as fatal for the owning link.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let opcode = self.buf[0];
        let len = (usize::from(self.buf[1]) << 16)
            | (usize::from(self.buf[2]) << 8)
            | usize::from(self.buf[3]);
        let total = HEADER_LEN + len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame = parse_payload(opcode, &self.buf[HEADER_LEN..total])?;
        self.buf.drain(..total);
        Ok(Some(frame))
    }
}
