//! Periodic rendezvous announce: posts this node's certificate and
//! dial address to an announce service, feeding verified replies into
//! the [`Connector`](crate::connector::Connector) (§6).
//!
//! Optional: a node that already knows its friends never needs this.
//! It exists for friends with no other side channel to find each
//! other's current address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;

use crate::connector::ConnectorCommand;
use crate::verifier::Verifier;

/// Default interval between announce cycles.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// Errors running one announce cycle.
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    /// The announce service couldn't be reached or returned an error
    /// status.
    #[error("announce request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// A line in the response wasn't `base64(cert) host:port`.
    #[error("malformed response line: {0}")]
    MalformedLine(String),
}

/// Announces this node and feeds back verified friends.
pub struct Publisher {
    announce_url: String,
    cert: Vec<u8>,
    local_addr: String,
    client: reqwest::Client,
    verifier: Arc<dyn Verifier>,
    commands: mpsc::UnboundedSender<ConnectorCommand>,
}

impl Publisher {
    /// Build a publisher announcing `cert`/`local_addr` to
    /// `announce_url`, verifying replies through `verifier` and feeding
    /// accepted friends into `commands` (a connector's inbox).
    #[must_use]
    pub fn new(
        announce_url: String,
        cert: Vec<u8>,
        local_addr: String,
        verifier: Arc<dyn Verifier>,
        commands: mpsc::UnboundedSender<ConnectorCommand>,
    ) -> Self {
        Self { announce_url, cert, local_addr, client: reqwest::Client::new(), verifier, commands }
    }

    /// Run announce cycles forever, every `interval`. Failures are
    /// logged and skipped; the loop never exits on its own.
    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(error) = self.announce_once().await {
                tracing::debug!(%error, "announce cycle failed");
            }
        }
    }

    /// POST this node's announcement, parse the response, and feed
    /// every verified friend to the connector.
    ///
    /// # Errors
    ///
    /// Returns [`PublisherError`] if the request fails or the response
    /// is malformed; already-parsed lines before a malformed one are
    /// still fed to the connector.
    pub async fn announce_once(&self) -> Result<(), PublisherError> {
        let body = format!("{} {}", BASE64.encode(&self.cert), self.local_addr);
        let response = self.client.post(&self.announce_url).body(body).send().await?;
        let response = response.error_for_status()?;
        let text = response.text().await?;

        for line in text.lines().filter(|l| !l.is_empty()) {
            self.ingest_line(line)?;
        }
        Ok(())
    }

    fn ingest_line(&self, line: &str) -> Result<(), PublisherError> {
        let (cert_b64, addr) =
            line.split_once(' ').ok_or_else(|| PublisherError::MalformedLine(line.to_string()))?;
        let cert = BASE64.decode(cert_b64).map_err(|_| PublisherError::MalformedLine(line.to_string()))?;
        let socket_addr: Option<SocketAddr> = addr.parse().ok();

        match self.verifier.verify_friend(&cert, socket_addr) {
            Ok(friend) => {
                let _ = self.commands.send(ConnectorCommand::AddFriend(friend));
            }
            Err(error) => {
                tracing::debug!(%error, "announce response rejected a peer");
            }
        }
        Ok(())
    }
}
