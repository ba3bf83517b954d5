//! Maintains direct links to friends (§4.5).
//!
//! The connector owns the eligible-friend list and the reconnect
//! schedule; it knows nothing about probes, routes, or tenants. Like
//! [`crate::controller::OverlayController`] it is driven as a
//! single-threaded actor over an inbox of [`ConnectorCommand`]s, and
//! dials run as detached tasks that report their outcome back through
//! the same inbox rather than being awaited inline.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use overlay_proto::ids::Digest;
use rand::Rng;
use tokio::sync::mpsc;

use crate::friend::Friend;
use crate::link::LinkHandle;

/// Errors bringing up a direct link to a friend.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// The dial attempt failed; the friend stays `pending` until the
    /// next reconnect sweep.
    #[error("dial failed: {0}")]
    Dial(String),
}

/// Establishes outbound links on demand. The connector only ever calls
/// `dial` for friends not already connected or in flight; production
/// code implements this over a TLS connector, tests over a channel.
pub trait Dialer: Send + Sync {
    /// Attempt to bring up a link to `friend`.
    fn dial(
        &self,
        friend: Friend,
    ) -> Pin<Box<dyn Future<Output = Result<LinkHandle, ConnectorError>> + Send>>;
}

/// Commands driving the connector's actor loop.
pub enum ConnectorCommand {
    /// Add a friend to the eligible set.
    AddFriend(Friend),
    /// Remove a friend and drop its link if connected.
    RemoveFriend(Digest),
    /// A link to a friend came up (inbound or outbound).
    ConnectionMade(LinkHandle),
    /// A friend's link was lost.
    ConnectionLost(Digest),
    /// The reconnect timer fired.
    TimerFired,
    /// A spawned dial attempt finished.
    DialFinished {
        /// The friend that was being dialed.
        digest: Digest,
        /// The dial outcome.
        result: Result<LinkHandle, ConnectorError>,
    },
}

/// Maintains this node's direct links.
pub struct Connector {
    friends: Vec<Friend>,
    connections: HashMap<Digest, LinkHandle>,
    pending: HashSet<Digest>,
    timer_armed: bool,
    dialer: Arc<dyn Dialer>,
    commands: mpsc::UnboundedSender<ConnectorCommand>,
}

impl Connector {
    /// Build an empty connector. `commands` is the sender half of its
    /// own inbox, cloned into spawned reconnect timers and dial tasks
    /// so they can report back without the caller threading it through.
    #[must_use]
    pub fn new(dialer: Arc<dyn Dialer>, commands: mpsc::UnboundedSender<ConnectorCommand>) -> Self {
        Self {
            friends: Vec::new(),
            connections: HashMap::new(),
            pending: HashSet::new(),
            timer_armed: false,
            dialer,
            commands,
        }
    }

    /// Drain `inbox` forever, applying each command in turn.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ConnectorCommand>) {
        while let Some(cmd) = inbox.recv().await {
            self.handle(cmd);
        }
    }

    /// Apply a single command to the connector's state.
    pub fn handle(&mut self, cmd: ConnectorCommand) {
        match cmd {
            ConnectorCommand::AddFriend(friend) => self.add_friend(friend),
            ConnectorCommand::RemoveFriend(digest) => self.remove_friend(&digest),
            ConnectorCommand::ConnectionMade(link) => self.connection_made(link),
            ConnectorCommand::ConnectionLost(digest) => self.connection_lost(&digest),
            ConnectorCommand::TimerFired => {
                self.timer_armed = false;
                self.reconnect();
            }
            ConnectorCommand::DialFinished { digest, result } => {
                self.pending.remove(&digest);
                match result {
                    Ok(link) => self.connection_made(link),
                    Err(e) => tracing::debug!(friend = ?digest, error = %e, "dial attempt failed"),
                }
            }
        }
    }

    /// Friends currently eligible for a direct link.
    #[must_use]
    pub fn friends(&self) -> &[Friend] {
        &self.friends
    }

    /// Whether `digest` currently has a live link.
    #[must_use]
    pub fn is_connected(&self, digest: &Digest) -> bool {
        self.connections.contains_key(digest)
    }

    /// Whether a dial to `digest` is currently in flight.
    #[must_use]
    pub fn is_pending(&self, digest: &Digest) -> bool {
        self.pending.contains(digest)
    }

    fn add_friend(&mut self, friend: Friend) {
        if self.friends.iter().any(|f| f.digest == friend.digest) {
            tracing::warn!(friend = ?friend.digest, "friend already present, ignoring duplicate add");
            return;
        }
        let idx = if self.friends.is_empty() {
            0
        } else {
            rand::rng().random_range(0..=self.friends.len())
        };
        self.friends.insert(idx, friend);
        self.schedule();
    }

    fn remove_friend(&mut self, digest: &Digest) {
        self.friends.retain(|f| &f.digest != digest);
        if let Some(link) = self.connections.remove(digest) {
            link.close();
        }
    }

    fn connection_made(&mut self, link: LinkHandle) {
        let digest = link.friend.digest;
        self.pending.remove(&digest);
        if self.connections.contains_key(&digest) {
            tracing::debug!(friend = ?digest, "link already present, dropping duplicate");
            link.close();
            return;
        }
        self.connections.insert(digest, link);
    }

    fn connection_lost(&mut self, digest: &Digest) {
        self.connections.remove(digest);
        self.schedule();
    }

    /// Arm the single reconnect timer if none is pending. Firing is
    /// reported back as [`ConnectorCommand::TimerFired`] so `reconnect`
    /// always runs on the actor's own loop, never from the timer task.
    fn schedule(&mut self) {
        if self.timer_armed {
            return;
        }
        self.timer_armed = true;
        let delay = Duration::from_millis(rand::rng().random_range(0..=5000));
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(ConnectorCommand::TimerFired);
        });
    }

    /// Dial every friend not already connected or in flight.
    fn reconnect(&mut self) {
        let targets: Vec<Friend> = self
            .friends
            .iter()
            .filter(|f| !self.connections.contains_key(&f.digest) && !self.pending.contains(&f.digest))
            .cloned()
            .collect();
        for friend in targets {
            let digest = friend.digest;
            self.pending.insert(digest);
            let dialer = self.dialer.clone();
            let commands = self.commands.clone();
            tokio::spawn(async move {
                let result = dialer.dial(friend).await;
                let _ = commands.send(ConnectorCommand::DialFinished { digest, result });
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn friend(byte: u8) -> Friend {
        Friend::from_cert(vec![byte], None)
    }

    fn make_link(friend: Friend) -> LinkHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        LinkHandle::new(friend, overlay_proto::ids::ConnectionId::random(), tx)
    }

    struct CountingDialer {
        calls: AtomicUsize,
        succeed: bool,
    }

    impl Dialer for CountingDialer {
        fn dial(
            &self,
            friend: Friend,
        ) -> Pin<Box<dyn Future<Output = Result<LinkHandle, ConnectorError>> + Send>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let succeed = self.succeed;
            Box::pin(async move {
                if succeed {
                    Ok(make_link(friend))
                } else {
                    Err(ConnectorError::Dial("refused".into()))
                }
            })
        }
    }

    fn connector(dialer: Arc<dyn Dialer>) -> (Connector, mpsc::UnboundedReceiver<ConnectorCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connector::new(dialer, tx), rx)
    }

    #[test]
    fn add_friend_ignores_duplicate() {
        let dialer = Arc::new(CountingDialer { calls: AtomicUsize::new(0), succeed: true });
        let (mut c, _rx) = connector(dialer);
        c.add_friend(friend(1));
        c.add_friend(friend(1));
        assert_eq!(c.friends().len(), 1);
    }

    #[test]
    fn remove_friend_closes_live_link() {
        let dialer = Arc::new(CountingDialer { calls: AtomicUsize::new(0), succeed: true });
        let (mut c, _rx) = connector(dialer);
        let f = friend(1);
        c.add_friend(f.clone());
        c.connection_made(make_link(f.clone()));
        assert!(c.is_connected(&f.digest));
        c.remove_friend(&f.digest);
        assert!(!c.is_connected(&f.digest));
        assert!(c.friends().is_empty());
    }

    #[test]
    fn connection_made_drops_duplicate_link_for_same_friend() {
        let dialer = Arc::new(CountingDialer { calls: AtomicUsize::new(0), succeed: true });
        let (mut c, _rx) = connector(dialer);
        let f = friend(1);
        c.connection_made(make_link(f.clone()));
        c.connection_made(make_link(f.clone()));
        assert!(c.is_connected(&f.digest));
    }

    #[tokio::test]
    async fn reconnect_dials_every_unconnected_friend_once() {
        let dialer = Arc::new(CountingDialer { calls: AtomicUsize::new(0), succeed: true });
        let (mut c, mut rx) = connector(dialer.clone());
        c.friends.push(friend(1));
        c.friends.push(friend(2));

        c.reconnect();
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(c.pending.len(), 2);

        for _ in 0..2 {
            let cmd = rx.recv().await.unwrap();
            c.handle(cmd);
        }
        assert!(c.pending.is_empty());
        assert_eq!(c.connections.len(), 2);
    }

    #[tokio::test]
    async fn failed_dial_leaves_friend_unconnected_and_not_pending() {
        let dialer = Arc::new(CountingDialer { calls: AtomicUsize::new(0), succeed: false });
        let (mut c, mut rx) = connector(dialer);
        c.friends.push(friend(1));

        c.reconnect();
        let cmd = rx.recv().await.unwrap();
        c.handle(cmd);

        assert!(c.pending.is_empty());
        assert!(!c.is_connected(&friend(1).digest));
    }

    #[tokio::test]
    async fn reconnect_skips_already_pending_or_connected_friends() {
        let dialer = Arc::new(CountingDialer { calls: AtomicUsize::new(0), succeed: true });
        let (mut c, _rx) = connector(dialer.clone());
        let f1 = friend(1);
        let f2 = friend(2);
        c.friends.push(f1.clone());
        c.friends.push(f2.clone());
        c.connection_made(make_link(f1));
        c.pending.insert(f2.digest);

        c.reconnect();
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn address_field_is_preserved_through_add() {
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let f = Friend::from_cert(vec![9], Some(addr));
        let dialer = Arc::new(CountingDialer { calls: AtomicUsize::new(0), succeed: true });
        let (mut c, _rx) = connector(dialer);
        c.add_friend(f.clone());
        assert_eq!(c.friends()[0].address, Some(addr));
    }
}
