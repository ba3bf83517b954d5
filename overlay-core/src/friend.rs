//! The [`Friend`] entity: the only canonical name for a peer (§3).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use overlay_proto::ids::Digest;
use sha1::{Digest as ShaDigest, Sha1};

/// A peer whose certificate we accept, identified by the SHA-1
/// fingerprint of its DER-encoded certificate.
///
/// Equality and hashing are by [`Friend::digest`] alone — two
/// `Friend`s with the same digest are the same peer even if their
/// cached address differs.
#[derive(Clone)]
pub struct Friend {
    /// DER-encoded certificate bytes presented at the TLS handshake.
    pub cert: Vec<u8>,
    /// Fingerprint of `cert`; the friend's identity.
    pub digest: Digest,
    /// Last known dial address, if any (used by the connector).
    pub address: Option<SocketAddr>,
}

impl Friend {
    /// Build a `Friend` from certificate bytes, computing its digest.
    #[must_use]
    pub fn from_cert(cert: Vec<u8>, address: Option<SocketAddr>) -> Self {
        let digest = digest_of_cert(&cert);
        Self { cert, digest, address }
    }
}

/// `Digest` a certificate's DER bytes the same way the verifier does,
/// so callers that only have a cert (e.g. the rendezvous client) can
/// compute the identity a [`Friend`] would resolve to.
#[must_use]
pub fn digest_of_cert(cert: &[u8]) -> Digest {
    let mut hasher = Sha1::new();
    hasher.update(cert);
    let out = hasher.finalize();
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&out);
    Digest::new(bytes)
}

impl PartialEq for Friend {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}
impl Eq for Friend {}

impl Hash for Friend {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl fmt::Debug for Friend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Friend")
            .field("digest", &self.digest)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_digest_only() {
        let a = Friend::from_cert(vec![1, 2, 3], Some("127.0.0.1:9000".parse().unwrap()));
        let b = Friend::from_cert(vec![1, 2, 3], None);
        assert_eq!(a, b);
    }

    #[test]
    fn different_certs_differ() {
        let a = Friend::from_cert(vec![1, 2, 3], None);
        let b = Friend::from_cert(vec![4, 5, 6], None);
        assert_ne!(a, b);
    }
}
