//! In-memory announcement directory keyed by certificate digest (§6).
//!
//! Each friend that wants to be discoverable posts its certificate and
//! dial address here; [`AnnouncementStore::announce`] upserts the entry
//! and [`AnnouncementStore::all_except`] returns everyone else's, which
//! is exactly what a `POST /announce` response needs. A stale entry
//! (no re-announce within the prune interval) is dropped the next time
//! [`AnnouncementStore::prune`] runs.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// An announced friend: its certificate and last known dial address.
#[derive(Debug, Clone)]
pub struct Announcement {
    /// DER-encoded certificate bytes.
    pub cert: Vec<u8>,
    /// `host:port` dial address, as announced.
    pub addr: String,
    #[allow(dead_code)]
    announced_at: Instant,
}

/// Announcements indexed by the SHA-1 digest of the certificate.
pub struct AnnouncementStore {
    entries: RwLock<HashMap<[u8; 20], Announcement>>,
}

impl Default for AnnouncementStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnouncementStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Upsert `digest`'s announcement, replacing any previous one.
    pub async fn announce(&self, digest: [u8; 20], cert: Vec<u8>, addr: String) {
        let mut entries = self.entries.write().await;
        entries.insert(digest, Announcement { cert, addr, announced_at: Instant::now() });
    }

    /// Every announced entry except `digest`'s own, so a caller never
    /// gets handed back its own announcement.
    pub async fn all_except(&self, digest: &[u8; 20]) -> Vec<Announcement> {
        let entries = self.entries.read().await;
        entries.iter().filter(|(d, _)| *d != digest).map(|(_, a)| a.clone()).collect()
    }

    /// How many friends are currently announced.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drop announcements older than `max_age`.
    pub async fn prune(&self, max_age: std::time::Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, a| now.duration_since(a.announced_at) < max_age);
    }
}
