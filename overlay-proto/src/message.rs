//! Overlay control messages carried by the framed codec.
//!
//! Opcodes 0-127 are reserved for overlay control (`PROBE`, `ESTABLISH`,
//! `RESET`); 128-255 are opaque application payloads carried on a virtual
//! path, addressed by `(pid, cid)`.

use crate::ids::{Cid, ConnectionId, Pid, Q, Sid};

/// Overlay control opcode: flood looking for a terminating node for `q`.
pub const OP_PROBE: u8 = 0;
/// Overlay control opcode: back-path message that builds forwarding state.
pub const OP_ESTABLISH: u8 = 1;
/// Overlay control opcode: tears down a path (forward or reverse).
pub const OP_RESET: u8 = 2;

/// Lowest opcode value reserved for application (non-control) messages.
pub const APP_OPCODE_MIN: u8 = 128;

/// Returns whether `opcode` belongs to the application range (`>= 128`).
#[must_use]
pub const fn is_app_opcode(opcode: u8) -> bool {
    opcode >= APP_OPCODE_MIN
}

/// A decoded overlay-layer frame: either a control message or an opaque
/// application message addressed to a virtual path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `PROBE` — flood looking for a node that terminates query `q`.
    Probe {
        /// Destination query class.
        q: Q,
        /// Channel id, stable end-to-end along the discovered path.
        cid: Cid,
        /// Session id chosen by the originator for this probe attempt.
        sid: Sid,
        /// Hop budget; relays decrement by one before forwarding.
        ttl: u8,
    },
    /// `ESTABLISH` — builds forwarding state back toward the originator.
    Establish {
        /// Path id for this hop.
        pid: Pid,
        /// Channel id, unchanged along the path.
        cid: Cid,
        /// Session id that correlates this reply with its probe.
        sid: Sid,
    },
    /// `RESET` — tears down a path, forward or reverse.
    Reset {
        /// Path id for this hop.
        pid: Pid,
        /// Channel id, unchanged along the path.
        cid: Cid,
    },
    /// An opaque application message addressed to `(pid, cid)`.
    App {
        /// Path id for this hop.
        pid: Pid,
        /// Channel id, unchanged along the path.
        cid: Cid,
        /// Application opcode, `>= 128`.
        opcode: u8,
        /// Opaque payload handed to the bound protocol unmodified.
        body: Vec<u8>,
    },
}

impl Frame {
    /// The wire opcode for this frame.
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        match self {
            Self::Probe { .. } => OP_PROBE,
            Self::Establish { .. } => OP_ESTABLISH,
            Self::Reset { .. } => OP_RESET,
            Self::App { opcode, .. } => *opcode,
        }
    }

    /// Construct an application frame, rejecting opcodes reserved for
    /// overlay control.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::ReservedOpcode`] if `opcode < 128`.
    pub fn app(pid: Pid, cid: Cid, opcode: u8, body: Vec<u8>) -> Result<Self, MessageError> {
        if !is_app_opcode(opcode) {
            return Err(MessageError::ReservedOpcode(opcode));
        }
        Ok(Self::App {
            pid,
            cid,
            opcode,
            body,
        })
    }
}

/// Errors constructing a [`Frame`] independent of wire encoding (e.g.
/// application code building a frame to send).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    /// An application message used an opcode below [`APP_OPCODE_MIN`].
    #[error("opcode {0} is reserved for overlay control, not application use")]
    ReservedOpcode(u8),
}

/// The address of a virtual path, handed to tenant factories when they
/// are asked to build a protocol for a newly accepted or bound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    /// The query class the path was opened for.
    pub q: Q,
    /// The path id on the local link.
    pub pid: Pid,
    /// The channel id, stable end-to-end.
    pub cid: Cid,
    /// Fingerprint of the friend at the other end of the local link.
    pub friend: crate::ids::Digest,
}

/// A freshly constructed link's random salt, generated once at
/// construction and reused for every PID derivation on that link.
#[must_use]
pub fn new_connection_id() -> ConnectionId {
    ConnectionId::generate()
}
