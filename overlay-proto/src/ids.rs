//! Fixed-width 20-byte identifiers used throughout the overlay wire
//! protocol: peer digests, query classes, and the path/channel/session
//! identifiers that route virtual paths across links.

use std::fmt;

use rand::RngCore;
use sha1::{Digest as ShaDigest, Sha1};

/// Length in bytes of every identifier in this module.
pub const ID_LEN: usize = 20;

macro_rules! fixed_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; ID_LEN]);

        impl $name {
            /// Build an identifier from raw bytes.
            #[must_use]
            pub const fn new(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Generate a random identifier using the system CSPRNG.
            #[must_use]
            pub fn random() -> Self {
                let mut bytes = [0u8; ID_LEN];
                rand::rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// All-zero identifier, used in tests and as a sentinel.
            #[must_use]
            pub const fn zero() -> Self {
                Self([0u8; ID_LEN])
            }

            /// Borrow the raw bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl From<[u8; ID_LEN]> for $name {
            fn from(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;

            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                Ok(Self(slice.try_into()?))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), short_hash(&self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", short_hash(&self.0))
            }
        }
    };
}

fixed_id!(Digest, "Cryptographic fingerprint of a peer certificate; the friend identity.");
fixed_id!(Q, "Query identifier — a destination class (e.g. a content root hash).");
fixed_id!(Pid, "Path id: per-link identifier for a virtual path, derived deterministically.");
fixed_id!(Cid, "Channel id: chosen by the probe originator, stable end-to-end along a path.");
fixed_id!(Sid, "Session id: chosen randomly per probe attempt by the originator.");
fixed_id!(ConnectionId, "20 random bytes chosen when a link is constructed; salts PID derivation.");

/// Render a 20-byte identifier as a short hex form: first and last five
/// hex pairs separated by an ellipsis, matching the reference
/// implementation's `short_hash` used for log lines.
#[must_use]
pub fn short_hash(bytes: &[u8; ID_LEN]) -> String {
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{}...{}", &hex[..5], &hex[hex.len() - 5..])
}

/// `H(a || b)`: SHA-1 of the concatenation of two byte slices, used to
/// derive `Pid` values deterministically from a salt and a link's
/// `connection_id`.
#[must_use]
pub fn derive(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> [u8; ID_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(a);
    hasher.update(b);
    let digest = hasher.finalize();
    let mut out = [0u8; ID_LEN];
    out.copy_from_slice(&digest);
    out
}

impl Pid {
    /// Derive the path id a terminating node uses for an accepted probe:
    /// `H(q || source.connection_id)`.
    #[must_use]
    pub fn terminate(q: &Q, source_connection_id: &ConnectionId) -> Self {
        Self(derive(&q.0, &source_connection_id.0))
    }

    /// Derive the path id used when relaying a PROBE onward on `target`:
    /// `H(cid || target.connection_id)`.
    #[must_use]
    pub fn relay(cid: &Cid, target_connection_id: &ConnectionId) -> Self {
        Self(derive(&cid.0, &target_connection_id.0))
    }

    /// Derive the path id used when forwarding an ESTABLISH onward on
    /// `target`: `H(pid || target.connection_id)`.
    #[must_use]
    pub fn forward(pid: &Pid, target_connection_id: &ConnectionId) -> Self {
        Self(derive(&pid.0, &target_connection_id.0))
    }
}

impl ConnectionId {
    /// Generate a fresh random connection id (20 bytes), as done once per
    /// link at construction time.
    #[must_use]
    pub fn generate() -> Self {
        Self::random()
    }
}
