//! Local TLS identity: a self-signed certificate and key pair used to
//! authenticate this node's end of every link (§4.3, §6). Trust in the
//! *content* of the certificate is never decided by the TLS stack —
//! only [`crate::verifier::Verifier`] decides whether a presented
//! certificate belongs to a friend.

use overlay_proto::ids::Digest;

use crate::friend::digest_of_cert;

/// Errors generating, loading, or persisting a node's identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// `rcgen` failed to generate a self-signed certificate/key pair.
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    /// Persisted identity material could not be read or written.
    #[error("identity storage error: {0}")]
    Storage(#[from] std::io::Error),
}

/// This node's long-term TLS identity: a self-signed certificate and
/// its private key, both DER-encoded, ready to hand to a `rustls`
/// server/client config.
pub struct Identity {
    /// DER-encoded self-signed certificate.
    pub cert_der: Vec<u8>,
    /// DER-encoded (PKCS#8) private key.
    pub key_der: Vec<u8>,
    /// This identity's digest, as every peer will see it.
    pub digest: Digest,
}

impl Identity {
    /// Generate a fresh self-signed certificate/key pair.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Generation`] if certificate generation
    /// fails.
    pub fn generate() -> Result<Self, IdentityError> {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(["overlay-peer".to_string()])?;
        let cert_der = cert.der().to_vec();
        let key_der = signing_key.serialize_der();
        let digest = digest_of_cert(&cert_der);
        Ok(Self { cert_der, key_der, digest })
    }

    /// Rebuild an identity from previously persisted DER bytes.
    #[must_use]
    pub fn from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        let digest = digest_of_cert(&cert_der);
        Self { cert_der, key_der, digest }
    }
}

/// Persistent storage for a node's [`Identity`].
pub trait IdentityStore: Send + Sync {
    /// Load a previously stored identity, or `None` if none exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if stored material is present but
    /// corrupted or unreadable.
    fn load(&self) -> Result<Option<Identity>, IdentityError>;

    /// Persist `identity` for future loads.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the identity cannot be written.
    fn save(&self, identity: &Identity) -> Result<(), IdentityError>;
}

/// File-backed identity store: writes `cert.der` and `key.der` into a
/// directory, creating it if necessary.
pub struct FileIdentityStore {
    dir: std::path::PathBuf,
}

impl FileIdentityStore {
    /// Point the store at `dir` (created on first `save`).
    #[must_use]
    pub fn new(dir: std::path::PathBuf) -> Self {
        Self { dir }
    }

    fn cert_path(&self) -> std::path::PathBuf {
        self.dir.join("cert.der")
    }

    fn key_path(&self) -> std::path::PathBuf {
        self.dir.join("key.der")
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<Identity>, IdentityError> {
        match (std::fs::read(self.cert_path()), std::fs::read(self.key_path())) {
            (Ok(cert_der), Ok(key_der)) => Ok(Some(Identity::from_der(cert_der, key_der))),
            (Err(e), _) | (_, Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            (Err(e), _) | (_, Err(e)) => Err(e.into()),
        }
    }

    fn save(&self, identity: &Identity) -> Result<(), IdentityError> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.cert_path(), &identity.cert_der)?;
        std::fs::write(self.key_path(), &identity.key_der)?;
        Ok(())
    }
}

/// In-memory store for tests: never touches disk.
#[derive(Default)]
pub struct InMemoryIdentityStore {
    slot: parking_lot::Mutex<Option<(Vec<u8>, Vec<u8>)>>,
}

impl IdentityStore for InMemoryIdentityStore {
    fn load(&self) -> Result<Option<Identity>, IdentityError> {
        Ok(self.slot.lock().clone().map(|(c, k)| Identity::from_der(c, k)))
    }

    fn save(&self, identity: &Identity) -> Result<(), IdentityError> {
        *self.slot.lock() = Some((identity.cert_der.clone(), identity.key_der.clone()));
        Ok(())
    }
}

/// Load the identity from `store`, generating and persisting a fresh
/// one if none exists yet.
///
/// # Errors
///
/// Returns [`IdentityError`] if loading, generation, or saving fails.
pub fn load_or_generate(store: &dyn IdentityStore) -> Result<Identity, IdentityError> {
    if let Some(identity) = store.load()? {
        return Ok(identity);
    }
    let identity = Identity::generate()?;
    store.save(&identity)?;
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_matching_digest() {
        let identity = Identity::generate().unwrap();
        assert_eq!(identity.digest, digest_of_cert(&identity.cert_der));
    }

    #[test]
    fn in_memory_store_round_trips() {
        let store = InMemoryIdentityStore::default();
        assert!(store.load().unwrap().is_none());

        let identity = Identity::generate().unwrap();
        store.save(&identity).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.digest, identity.digest);
        assert_eq!(loaded.cert_der, identity.cert_der);
    }

    #[test]
    fn load_or_generate_persists_across_calls() {
        let store = InMemoryIdentityStore::default();
        let first = load_or_generate(&store).unwrap();
        let second = load_or_generate(&store).unwrap();
        assert_eq!(first.digest, second.digest);
    }
}
