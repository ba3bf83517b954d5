//! A link connection owns one TLS socket to one friend (§4.3).
//!
//! The socket plumbing is split into three cooperating pieces: a
//! reader task that decodes frames off the wire and forwards them to
//! the overlay controller, a writer task that owns this link's
//! [`Scfq`] and drains it onto the socket, and a cheap, cloneable
//! [`LinkHandle`] that the controller and connector use to address
//! the link without touching the socket directly.
//!
//! Real `rustls` sessions never validate the peer certificate chain —
//! `tokio-rustls` is configured (in the binary entry point) to accept
//! any client certificate and perform no server-name validation. Trust
//! is decided here, once, against a [`Verifier`], after the handshake
//! completes.

use std::net::SocketAddr;

use overlay_proto::codec::{self, Decoder};
use overlay_proto::ids::{ConnectionId, Digest};
use overlay_proto::message::Frame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::friend::Friend;
use crate::scfq::Scfq;
use crate::verifier::{Verifier, VerifierError};

/// Errors bringing up or running a link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The peer presented no certificate at all.
    #[error("peer presented no certificate")]
    NoPeerCertificate,
    /// The application-level verifier rejected the peer.
    #[error(transparent)]
    Verifier(#[from] VerifierError),
    /// A framing error on the wire; fatal for this link.
    #[error(transparent)]
    Codec(#[from] codec::CodecError),
    /// An I/O error on the underlying socket; fatal for this link.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A link's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// TLS handshake and verification not yet complete.
    Handshaking,
    /// Verified and exchanging frames.
    Up,
    /// Transport lost; the link is no longer usable.
    Closed,
}

/// Verify a peer's presented certificate chain against `verifier`,
/// producing the [`Friend`] it resolves to.
///
/// Callers extract `certs` from the `rustls` session after the
/// handshake completes (`session.peer_certificates()`); this function
/// only owns the verification decision, so it can be exercised without
/// a live TLS socket.
///
/// # Errors
///
/// Returns [`LinkError::NoPeerCertificate`] if no certificate was
/// presented, or [`LinkError::Verifier`] if the verifier rejects it.
pub fn verify_peer(
    certs: Option<&[&[u8]]>,
    verifier: &dyn Verifier,
    address: Option<SocketAddr>,
) -> Result<Friend, LinkError> {
    let leaf = certs.and_then(|c| c.first()).ok_or(LinkError::NoPeerCertificate)?;
    Ok(verifier.verify_friend(leaf, address)?)
}

/// A message sent to a link's writer task.
pub enum LinkOutbound {
    /// Enqueue `frame` under `flow`'s SCFQ bucket.
    Frame {
        /// The billed flow: `Some(inbound link)` when forwarding,
        /// `None` for locally originated frames.
        flow: Option<Digest>,
        /// The frame to encode and send.
        frame: Frame,
    },
    /// Stop writing and close the link.
    Close,
}

/// An event raised by a link's reader task, consumed by the overlay
/// controller.
pub enum LinkEvent {
    /// A complete frame was decoded off the wire.
    FrameReceived {
        /// The link it arrived on.
        link: LinkHandle,
        /// The decoded frame.
        frame: Frame,
    },
    /// The link's transport was lost (EOF, I/O error, or malformed
    /// frame).
    Lost {
        /// The friend whose link was lost.
        digest: Digest,
    },
}

/// A cheap, cloneable reference to a live link.
///
/// Holds no socket state itself — sending a frame just pushes a
/// [`LinkOutbound`] onto the link's writer-task inbox.
#[derive(Clone)]
pub struct LinkHandle {
    /// The friend at the other end.
    pub friend: Friend,
    /// This link's random salt, used in PID derivation.
    pub connection_id: ConnectionId,
    outbound: mpsc::UnboundedSender<LinkOutbound>,
}

impl LinkHandle {
    /// Wrap a writer-task inbox into a handle.
    #[must_use]
    pub fn new(
        friend: Friend,
        connection_id: ConnectionId,
        outbound: mpsc::UnboundedSender<LinkOutbound>,
    ) -> Self {
        Self { friend, connection_id, outbound }
    }

    /// Enqueue `frame` for transmission, billed to `flow`.
    ///
    /// Silently drops the request if the writer task has already
    /// exited — the controller will separately observe the link loss.
    pub fn send_frame(&self, flow: Option<Digest>, frame: Frame) {
        let _ = self.outbound.send(LinkOutbound::Frame { flow, frame });
    }

    /// Close the link; the writer task exits as soon as it drains.
    pub fn close(&self) {
        let _ = self.outbound.send(LinkOutbound::Close);
    }
}

impl PartialEq for LinkHandle {
    fn eq(&self, other: &Self) -> bool {
        self.friend.digest == other.friend.digest
    }
}
impl Eq for LinkHandle {}

impl std::hash::Hash for LinkHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.friend.digest.hash(state);
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle").field("friend", &self.friend).finish()
    }
}

/// Drive a link's writer task: owns the SCFQ queue, drains it onto
/// `writer` in finish-time order.
///
/// Backpressure from the transport is implicit in `write_all`'s
/// `.await` — a slow peer simply delays the next dequeue, which is
/// this task's only job between messages.
///
/// # Errors
///
/// Returns a [`LinkError`] on a fatal encode or I/O failure; the
/// caller should treat this as link loss.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut inbox: mpsc::UnboundedReceiver<LinkOutbound>,
) -> Result<(), LinkError> {
    let mut queue: Scfq<Option<Digest>> = Scfq::new();
    'outer: loop {
        if queue.is_empty() {
            match inbox.recv().await {
                Some(LinkOutbound::Frame { flow, frame }) => {
                    queue.enqueue(flow, codec::encode(&frame)?);
                }
                Some(LinkOutbound::Close) | None => break 'outer,
            }
        }
        // Opportunistically absorb anything already queued before
        // writing, so a burst enqueued back-to-back still interleaves
        // fairly instead of degrading to one write per wakeup.
        while let Ok(msg) = inbox.try_recv() {
            match msg {
                LinkOutbound::Frame { flow, frame } => queue.enqueue(flow, codec::encode(&frame)?),
                LinkOutbound::Close => break 'outer,
            }
        }
        while let Some((_flow, bytes)) = queue.dequeue() {
            writer.write_all(&bytes).await?;
        }
    }
    writer.shutdown().await.ok();
    Ok(())
}

/// Drive a link's reader task: decodes frames off `reader` and
/// forwards them as [`LinkEvent`]s until EOF, I/O error, or a
/// malformed frame, at which point it reports [`LinkEvent::Lost`] and
/// returns.
pub async fn run_reader<R: AsyncRead + Unpin>(
    mut reader: R,
    link: LinkHandle,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut decoder = Decoder::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                decoder.push(&buf[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => {
                            if events_tx
                                .send(LinkEvent::FrameReceived { link: link.clone(), frame })
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(friend = ?link.friend.digest, error = %e, "malformed frame, closing link");
                            let _ = events_tx.send(LinkEvent::Lost { digest: link.friend.digest });
                            return;
                        }
                    }
                }
            }
        }
    }
    let _ = events_tx.send(LinkEvent::Lost { digest: link.friend.digest });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::PublicVerifier;

    #[test]
    fn verify_peer_rejects_missing_certificate() {
        let err = verify_peer(None, &PublicVerifier, None).unwrap_err();
        assert!(matches!(err, LinkError::NoPeerCertificate));
    }

    #[test]
    fn verify_peer_accepts_first_cert_in_chain() {
        let chain: [&[u8]; 2] = [b"leaf-cert", b"intermediate"];
        let friend = verify_peer(Some(&chain), &PublicVerifier, None).unwrap();
        assert_eq!(friend.cert, b"leaf-cert");
    }

    #[tokio::test]
    async fn writer_task_encodes_and_writes_frames() {
        use overlay_proto::ids::{Cid, Pid, Q, Sid};

        let (tx, rx) = mpsc::unbounded_channel();
        let mut sink = Vec::new();
        let frame = Frame::Probe {
            q: Q::zero(),
            cid: Cid::zero(),
            sid: Sid::zero(),
            ttl: 5,
        };
        tx.send(LinkOutbound::Frame { flow: None, frame: frame.clone() }).unwrap();
        tx.send(LinkOutbound::Close).unwrap();
        drop(tx);

        // Write into a Vec via a cursor that implements AsyncWrite.
        let mut cursor = std::io::Cursor::new(&mut sink);
        run_writer(&mut cursor, rx).await.unwrap();

        let mut decoder = Decoder::new();
        decoder.push(&sink);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), frame);
        let _ = Pid::zero();
    }

    #[tokio::test]
    async fn reader_task_emits_lost_on_malformed_frame() {
        let (friend_tx, _friend_rx) = mpsc::unbounded_channel();
        let friend = Friend::from_cert(vec![1, 2, 3], None);
        let link = LinkHandle::new(friend.clone(), ConnectionId::random(), friend_tx);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        // RESET opcode (expects 40 bytes) with a truncated payload.
        let bytes = vec![2, 0, 0, 5, 0, 0, 0, 0, 0];
        run_reader(std::io::Cursor::new(bytes), link, events_tx).await;

        match events_rx.recv().await {
            Some(LinkEvent::Lost { digest }) => assert_eq!(digest, friend.digest),
            _ => panic!("expected Lost event"),
        }
    }
}
