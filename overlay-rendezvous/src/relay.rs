//! Announce service core: shared state and the `POST /announce` handler
//! (§6).
//!
//! A friend wanting to be discoverable posts its certificate and dial
//! address as `base64(cert) host:port`; the service replies with every
//! other currently-announced entry in the same line format. It never
//! interprets the certificate beyond hashing it for the store key —
//! trust in the certificate's content is a friend-graph decision made
//! by each node's own [`overlay-core` verifier](../../overlay_core/verifier/index.html).

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest as _, Sha1};

use crate::store::AnnouncementStore;

/// Errors parsing an inbound announcement.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AnnounceError {
    /// The body wasn't exactly `base64(cert) host:port`.
    #[error("malformed announcement body")]
    MalformedBody,
    /// The certificate field didn't decode as base64.
    #[error("certificate is not valid base64")]
    BadCertEncoding,
}

/// Shared announce-service state.
pub struct AnnounceState {
    /// The announcement directory itself.
    pub store: AnnouncementStore,
}

impl Default for AnnounceState {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnounceState {
    /// An empty announce state.
    #[must_use]
    pub fn new() -> Self {
        Self { store: AnnouncementStore::new() }
    }
}

fn digest_of(cert: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(cert);
    let out = hasher.finalize();
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&out);
    bytes
}

/// Parse one announcement line into `(digest, cert, addr)`.
///
/// # Errors
///
/// Returns [`AnnounceError`] if the line isn't `base64(cert) host:port`.
fn parse_announcement(body: &str) -> Result<([u8; 20], Vec<u8>, String), AnnounceError> {
    let line = body.trim();
    let (cert_b64, addr) = line.split_once(' ').ok_or(AnnounceError::MalformedBody)?;
    if addr.is_empty() {
        return Err(AnnounceError::MalformedBody);
    }
    let cert = BASE64.decode(cert_b64).map_err(|_| AnnounceError::BadCertEncoding)?;
    let digest = digest_of(&cert);
    Ok((digest, cert, addr.to_string()))
}

fn format_entries(entries: &[crate::store::Announcement]) -> String {
    entries.iter().map(|a| format!("{} {}", BASE64.encode(&a.cert), a.addr)).collect::<Vec<_>>().join("\n")
}

/// `POST /announce`: upsert the caller's entry, reply with everyone
/// else's.
async fn announce_handler(
    State(state): State<Arc<AnnounceState>>,
    body: String,
) -> Result<String, (StatusCode, String)> {
    let (digest, cert, addr) =
        parse_announcement(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    state.store.announce(digest, cert, addr).await;
    Ok(format_entries(&state.store.all_except(&digest).await))
}

/// Build the announce service's router over `state`.
pub fn router(state: Arc<AnnounceState>) -> axum::Router {
    axum::Router::new().route("/announce", axum::routing::post(announce_handler)).with_state(state)
}

/// Start the announce service, returning the bound address and a handle
/// to its serving task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to `addr`.
pub async fn start_server(
    addr: &str,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    start_server_with_state(addr, Arc::new(AnnounceState::new())).await
}

/// Start the announce service with a pre-configured [`AnnounceState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to `addr`.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<AnnounceState>,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "announce service error");
        }
    });

    Ok((bound_addr, handle))
}

/// Spawn a background sweep that prunes stale announcements every
/// `interval`, honoring entries no older than `max_age`.
pub fn spawn_pruner(state: Arc<AnnounceState>, interval: std::time::Duration, max_age: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            state.store.prune(max_age).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body() -> String {
        format!("{} 10.0.0.1:9000", BASE64.encode(b"alice-cert"))
    }

    #[test]
    fn parse_announcement_round_trips_address() {
        let (_, cert, addr) = parse_announcement(&sample_body()).unwrap();
        assert_eq!(cert, b"alice-cert");
        assert_eq!(addr, "10.0.0.1:9000");
    }

    #[test]
    fn parse_announcement_rejects_missing_address() {
        let body = BASE64.encode(b"alice-cert");
        assert_eq!(parse_announcement(&body), Err(AnnounceError::MalformedBody));
    }

    #[test]
    fn parse_announcement_rejects_bad_base64() {
        let body = "not-valid-base64!! 10.0.0.1:9000";
        assert_eq!(parse_announcement(body), Err(AnnounceError::BadCertEncoding));
    }

    #[tokio::test]
    async fn handler_upserts_and_excludes_caller() {
        let state = Arc::new(AnnounceState::new());
        let alice = format!("{} 10.0.0.1:9000", BASE64.encode(b"alice-cert"));
        let bob = format!("{} 10.0.0.2:9000", BASE64.encode(b"bob-cert"));

        let resp = announce_handler(State(state.clone()), alice).await.unwrap();
        assert!(resp.is_empty());

        let resp = announce_handler(State(state.clone()), bob).await.unwrap();
        assert!(resp.contains("10.0.0.1:9000"));
        assert!(!resp.contains("10.0.0.2:9000"));
    }

    #[tokio::test]
    async fn handler_rejects_malformed_body() {
        let state = Arc::new(AnnounceState::new());
        let err = announce_handler(State(state), "garbage".to_string()).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn start_test_server_round_trips_over_http() {
        let (addr, _handle) = start_server("127.0.0.1:0").await.unwrap();
        let client = reqwest::Client::new();
        let body = format!("{} 127.0.0.1:9001", BASE64.encode(b"test-cert"));
        let resp =
            client.post(format!("http://{addr}/announce")).body(body).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
