//! Maps a peer certificate to a [`Friend`] identity or rejects the
//! peer (§4.4). The TLS stack itself performs no chain validation —
//! every presented client certificate is accepted at the transport
//! layer; trust is decided here, against application state.

use std::collections::HashMap;
use std::net::SocketAddr;

use overlay_proto::ids::Digest;
use parking_lot::RwLock;

use crate::friend::{Friend, digest_of_cert};

/// Errors rejecting a peer during verification.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifierError {
    /// A contacts-only verifier found no contact for the presented
    /// certificate's digest.
    #[error("peer is not an allowed contact")]
    NotAllowedPeer,
}

/// Maps a presented certificate to a [`Friend`] identity, or rejects
/// the connection.
pub trait Verifier: Send + Sync {
    /// Decide whether `cert` (DER-encoded) belongs to a friend.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError::NotAllowedPeer`] if the peer is
    /// rejected.
    fn verify_friend(&self, cert: &[u8], address: Option<SocketAddr>) -> Result<Friend, VerifierError>;
}

/// Accepts any presented certificate, synthesizing a `Friend` from it.
///
/// Used by nodes that trust whoever dials them (e.g. a public
/// rendezvous-discovered mesh with no curated contact list).
#[derive(Debug, Default, Clone, Copy)]
pub struct PublicVerifier;

impl Verifier for PublicVerifier {
    fn verify_friend(&self, cert: &[u8], address: Option<SocketAddr>) -> Result<Friend, VerifierError> {
        Ok(Friend::from_cert(cert.to_vec(), address))
    }
}

/// A curated entry in the [`ContactVerifier`]'s index: a known
/// certificate digest, optionally paired with a dial address.
#[derive(Debug, Clone)]
pub struct Contact {
    /// The contact's certificate digest.
    pub digest: Digest,
    /// The contact's full certificate, if known ahead of the first
    /// handshake (used to pre-seed the connector).
    pub cert: Option<Vec<u8>>,
    /// Last known dial address.
    pub address: Option<SocketAddr>,
}

/// Verifies peers against a curated contact index.
///
/// When `only_contacts` is set, unknown peers are rejected with
/// [`VerifierError::NotAllowedPeer`]; otherwise an unknown peer is
/// accepted and synthesized into a `Friend` anyway (accept-but-note
/// semantics, matching §4.4).
pub struct ContactVerifier {
    contacts: RwLock<HashMap<Digest, Contact>>,
    only_contacts: bool,
}

impl ContactVerifier {
    /// Build a verifier over `contacts`, with `only_contacts` toggling
    /// whether peers outside that set are rejected.
    #[must_use]
    pub fn new(contacts: Vec<Contact>, only_contacts: bool) -> Self {
        let map = contacts.into_iter().map(|c| (c.digest, c)).collect();
        Self {
            contacts: RwLock::new(map),
            only_contacts,
        }
    }

    /// Add or replace a contact in the index.
    pub fn add_contact(&self, contact: Contact) {
        self.contacts.write().insert(contact.digest, contact);
    }

    /// Remove a contact from the index by digest.
    pub fn remove_contact(&self, digest: &Digest) {
        self.contacts.write().remove(digest);
    }

    /// Whether `digest` is present in the contact index.
    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        self.contacts.read().contains_key(digest)
    }
}

impl Verifier for ContactVerifier {
    fn verify_friend(&self, cert: &[u8], address: Option<SocketAddr>) -> Result<Friend, VerifierError> {
        let digest = digest_of_cert(cert);
        if self.contacts.read().contains_key(&digest) {
            return Ok(Friend::from_cert(cert.to_vec(), address));
        }
        if self.only_contacts {
            return Err(VerifierError::NotAllowedPeer);
        }
        Ok(Friend::from_cert(cert.to_vec(), address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_verifier_always_succeeds() {
        let v = PublicVerifier;
        let friend = v.verify_friend(b"some-cert", None).unwrap();
        assert_eq!(friend.cert, b"some-cert");
    }

    #[test]
    fn contact_verifier_accepts_known_contact() {
        let cert = b"alice-cert".to_vec();
        let digest = digest_of_cert(&cert);
        let v = ContactVerifier::new(
            vec![Contact { digest, cert: Some(cert.clone()), address: None }],
            true,
        );
        assert!(v.verify_friend(&cert, None).is_ok());
    }

    #[test]
    fn contacts_only_rejects_unknown_peer() {
        let v = ContactVerifier::new(vec![], true);
        let err = v.verify_friend(b"stranger", None).unwrap_err();
        assert_eq!(err, VerifierError::NotAllowedPeer);
    }

    #[test]
    fn open_mode_accepts_unknown_peer() {
        let v = ContactVerifier::new(vec![], false);
        assert!(v.verify_friend(b"stranger", None).is_ok());
    }
}
