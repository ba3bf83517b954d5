//! Orchestrates every bound [`super::connection::Connection`] sharing
//! one torrent's [`PiecePicker`], [`Schedule`], [`Choker`], and
//! [`Storage`] (§4.8).
//!
//! A single [`BtController`] is wrapped in `Arc<parking_lot::Mutex<_>>`
//! and shared by every [`super::connection::Connection`] bound to it —
//! the overlay controller still drives everything from one task, but
//! `Protocol` trait objects must be `Send` to live inside it, so the
//! BT tenant's cross-connection state (rechoke decisions, the shared
//! piece picker, broadcasting `HAVE`) needs a lock rather than the
//! `&mut self` exclusivity the overlay controller itself enjoys.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use overlay_proto::bt::BtMessage;
use overlay_proto::ids::Q;
use overlay_proto::message::Address;
use parking_lot::Mutex;

use crate::controller::transport::{Protocol, TenantFactory, Transport};

use super::choker::{ChokeTarget, Choker};
use super::picker::PiecePicker;
use super::schedule::Schedule;
use super::storage::{Metainfo, Storage};
use super::{BtError, ConnId, PieceId};

/// Observes connection lifecycle events, e.g. for progress reporting.
/// Both methods default to doing nothing.
pub trait BtDelegate: Send {
    /// A new connection bound to this torrent.
    fn connection_made(&mut self, _id: ConnId) {}
    /// A connection bound to this torrent was lost.
    fn connection_lost(&mut self, _id: ConnId) {}
}

/// Per-connection state the controller needs to drive the BT state
/// machine and feed the choker (§4.8's connection table).
struct ConnectionState {
    transport: Option<Transport>,
    handshake_done: bool,
    /// Are we choking this peer (withholding uploads)?
    local_choking: bool,
    /// Are we interested in pieces this peer holds?
    interesting: bool,
    /// Is this peer choking us (withholding our downloads)?
    remote_choked: bool,
    /// Is this peer interested in pieces we hold?
    remote_interested: bool,
    /// Pieces this peer has advertised holding.
    remote_pieces: HashSet<PieceId>,
    /// Chunk requests we've sent this peer that haven't been honored,
    /// rejected, or cancelled yet.
    pending: Vec<(PieceId, u32, u32)>,
    /// Bytes received from this peer since the last rechoke tick; the
    /// choker's "current download rate" ranking signal.
    download_rate: f64,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            transport: None,
            handshake_done: false,
            local_choking: true,
            interesting: false,
            remote_choked: true,
            remote_interested: false,
            remote_pieces: HashSet::new(),
            pending: Vec::new(),
            download_rate: 0.0,
        }
    }
}

impl ChokeTarget for ConnectionState {
    fn is_interested(&self) -> bool {
        self.remote_interested
    }

    fn is_choking(&self) -> bool {
        self.local_choking
    }

    fn download_rate(&self) -> f64 {
        self.download_rate
    }

    fn set_choking(&mut self, choking: bool) {
        if self.local_choking == choking {
            return;
        }
        self.local_choking = choking;
        if let Some(transport) = &self.transport {
            let msg = if choking { BtMessage::Choke } else { BtMessage::Unchoke };
            transport.send_message(msg.opcode(), msg.encode_body());
        }
    }
}

/// Orchestrates every connection sharing one torrent.
pub struct BtController<S: Storage> {
    metainfo: Metainfo,
    backlog: usize,
    picker: PiecePicker,
    schedule: Schedule,
    choker: Choker,
    storage: S,
    conns: HashMap<ConnId, ConnectionState>,
    delegate: Option<Box<dyn BtDelegate>>,
}

impl<S: Storage> BtController<S> {
    /// Build a controller for one torrent. `storage` should already
    /// have been `check()`ed so `get_number_completed`/`have` reflect
    /// reality before the picker and schedule are seeded from them.
    #[must_use]
    pub fn new(metainfo: Metainfo, storage: S, chunk_size: u32, backlog: usize, max_uploads: usize) -> Self {
        let not_held: Vec<PieceId> =
            metainfo.piece_hashes.iter().copied().filter(|p| !storage.have(p)).collect();
        let picker = PiecePicker::new(not_held);
        let schedule = Schedule::new(&metainfo, &storage, chunk_size);
        Self {
            metainfo,
            backlog,
            picker,
            schedule,
            choker: Choker::new(max_uploads),
            storage,
            conns: HashMap::new(),
            delegate: None,
        }
    }

    /// Install a delegate to observe connection lifecycle events.
    pub fn set_delegate(&mut self, delegate: Box<dyn BtDelegate>) {
        self.delegate = Some(delegate);
    }

    /// How many connections are currently bound.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    // -- lifecycle, driven by `Connection`'s `Protocol` impl --------

    pub(super) fn connection_made(&mut self, id: ConnId, transport: Transport) {
        let mut state = ConnectionState::default();
        state.transport = Some(transport);
        self.conns.insert(id, state);
        self.choker.connection_made(id);
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.connection_made(id);
        }
        self.send(id, BtMessage::Hello);
    }

    pub(super) fn connection_lost(&mut self, id: ConnId) {
        let Some(state) = self.conns.remove(&id) else { return };
        for piece in &state.remote_pieces {
            self.picker.lost_have(*piece);
        }
        self.choker.connection_lost(&id);
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.connection_lost(id);
        }
        if !state.pending.is_empty() {
            // The transport drops in-flight chunks silently; resubmit
            // them as rejections so other connections pick them back
            // up (§4.8's "requests re-issued on loss").
            self.requests_rejected(id, &state.pending);
        }
    }

    pub(super) fn on_message(&mut self, id: ConnId, opcode: u8, body: &[u8]) {
        let msg = match BtMessage::decode(opcode, body) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(?id, %error, "malformed bt message, dropping connection");
                self.disconnect(id);
                return;
            }
        };

        let handshake_done = self.conns.get(&id).is_some_and(|c| c.handshake_done);
        if !handshake_done {
            if !matches!(msg, BtMessage::Hello) {
                // §4.8: any non-HELLO before the handshake completes
                // closes the connection and nothing else happens.
                tracing::warn!(?id, error = %BtError::HandshakeNotComplete, "dropping connection");
                self.disconnect(id);
                return;
            }
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.handshake_done = true;
            }
            self.send_bitfield(id);
            return;
        }

        match msg {
            BtMessage::Hello => {}
            BtMessage::Choke => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.remote_choked = true;
                }
            }
            BtMessage::Unchoke => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.remote_choked = false;
                }
                self.request_more(id, None);
            }
            BtMessage::Interested => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.remote_interested = true;
                }
                self.maybe_immediate_rechoke(id);
            }
            BtMessage::NotInterested => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.remote_interested = false;
                }
                self.maybe_immediate_rechoke(id);
            }
            BtMessage::Have(hashes) => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.remote_pieces.extend(hashes.iter().copied());
                }
                self.got_have(id, &hashes);
            }
            BtMessage::HaveNone => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.remote_pieces.clear();
                }
            }
            BtMessage::HaveAll => {
                let all = self.metainfo.piece_hashes.clone();
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.remote_pieces.extend(all.iter().copied());
                }
                self.got_have(id, &all);
            }
            BtMessage::Request(piece, offset, length) => self.serve_request(id, piece, offset, length),
            BtMessage::Reject(piece, offset, length) => self.requests_rejected(id, &[(piece, offset, length)]),
            BtMessage::Cancel(..) => {
                // We serve REQUESTs synchronously (read-then-CHUNK in
                // the same call), so there's no queued incoming
                // request for a CANCEL to withdraw.
            }
            BtMessage::Chunk(piece, offset, data) => self.request_honored(id, piece, offset, data),
        }
    }

    // -- BT controller operations (§4.8) -----------------------------

    fn got_have(&mut self, id: ConnId, pieces: &[PieceId]) {
        for &piece in pieces {
            self.picker.got_have(piece);
        }
        self.check_interest(id, pieces);
        self.request_more(id, None);
    }

    fn check_interest(&mut self, id: ConnId, pieces: &[PieceId]) {
        let Some(conn) = self.conns.get(&id) else { return };
        if conn.interesting {
            return;
        }
        let now_interested =
            pieces.iter().any(|p| conn.remote_pieces.contains(p) && self.schedule.have_requests(p));
        if now_interested {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.interesting = true;
            }
            self.send(id, BtMessage::Interested);
        }
    }

    /// Scans every piece the connection holds (not just a caller
    /// subset) — matching the reference implementation's actual
    /// behavior despite its misleadingly named parameter.
    fn check_lost_interest(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(&id) else { return };
        if !conn.interesting || !conn.pending.is_empty() {
            return;
        }
        let still_needed = conn.remote_pieces.iter().any(|p| self.schedule.have_requests(p));
        if !still_needed {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.interesting = false;
            }
            self.send(id, BtMessage::NotInterested);
        }
    }

    fn request_more(&mut self, id: ConnId, pieces: Option<&[PieceId]>) {
        let Some(conn) = self.conns.get(&id) else { return };
        if conn.remote_choked || conn.pending.len() >= self.backlog {
            return;
        }
        let candidates: Vec<PieceId> = match pieces {
            Some(p) => p.to_vec(),
            None => self.picker.iter(),
        };

        for piece in candidates {
            let holds = self.conns.get(&id).is_some_and(|c| c.remote_pieces.contains(&piece));
            if !holds {
                continue;
            }
            loop {
                let full = self.conns.get(&id).is_some_and(|c| c.pending.len() >= self.backlog);
                if full {
                    // Backlog filled mid-piece: stop immediately, skip
                    // the lost-interest recheck for this call entirely.
                    return;
                }
                match self.schedule.get_request(&piece) {
                    Some((offset, length)) => {
                        if let Some(conn) = self.conns.get_mut(&id) {
                            conn.pending.push((piece, offset, length));
                        }
                        self.send(id, BtMessage::Request(piece, offset, length));
                    }
                    None => {
                        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
                        for other in ids {
                            self.check_lost_interest(other);
                        }
                        break;
                    }
                }
            }
        }
    }

    fn request_honored(&mut self, id: ConnId, piece: PieceId, offset: u32, data: Vec<u8>) {
        self.picker.chunk_received(piece);
        self.schedule.honor_request(&piece, offset, u32::try_from(data.len()).unwrap_or(u32::MAX));
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.pending.retain(|&(p, o, _)| !(p == piece && o == offset));
            #[allow(clippy::cast_precision_loss)]
            let bytes = data.len() as f64;
            conn.download_rate += bytes;
        }

        match self.storage.write(&piece, offset, &data) {
            Ok(true) => {
                self.picker.complete(piece);
                self.schedule.complete(&piece);
                self.broadcast_have(piece);
            }
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(?id, %error, "storage write failed, dropping connection");
                self.disconnect(id);
                return;
            }
        }

        self.request_more(id, None);
        let drained = self.conns.get(&id).is_some_and(|c| c.interesting && c.pending.is_empty());
        if drained {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.interesting = false;
            }
            self.send(id, BtMessage::NotInterested);
        }
    }

    fn requests_rejected(&mut self, id: ConnId, requests: &[(PieceId, u32, u32)]) {
        if let Some(conn) = self.conns.get_mut(&id) {
            for &(p, o, l) in requests {
                conn.pending.retain(|&(pp, oo, ll)| !(pp == p && oo == o && ll == l));
            }
        }
        // `put_request` tells us whether the piece already had other
        // pending chunks before this one was returned. When it didn't,
        // the piece just went from fully-spoken-for back to available,
        // which is the transition other connections need to hear about.
        let mut renewed_interest = Vec::new();
        for &(piece, offset, length) in requests {
            if !self.schedule.put_request(&piece, offset, length) {
                renewed_interest.push(piece);
            }
        }
        if renewed_interest.is_empty() {
            return;
        }
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for other in ids {
            self.check_interest(other, &renewed_interest);
            self.request_more(other, None);
        }
    }

    fn serve_request(&mut self, id: ConnId, piece: PieceId, offset: u32, length: u32) {
        match self.storage.read(&piece, offset, length) {
            Some(data) => self.send(id, BtMessage::Chunk(piece, offset, data)),
            None => self.send(id, BtMessage::Reject(piece, offset, length)),
        }
    }

    fn send_bitfield(&mut self, id: ConnId) {
        let completed = self.storage.get_number_completed();
        let total = self.metainfo.piece_hashes.len();
        let msg = if completed == 0 {
            BtMessage::HaveNone
        } else if completed == total {
            BtMessage::HaveAll
        } else {
            BtMessage::Have(self.storage.iter_completed())
        };
        self.send(id, msg);
    }

    fn broadcast_have(&self, piece: PieceId) {
        let msg = BtMessage::Have(vec![piece]);
        for conn in self.conns.values() {
            if let Some(transport) = &conn.transport {
                transport.send_message(msg.opcode(), msg.encode_body());
            }
        }
    }

    fn send(&self, id: ConnId, msg: BtMessage) {
        if let Some(conn) = self.conns.get(&id) {
            if let Some(transport) = &conn.transport {
                transport.send_message(msg.opcode(), msg.encode_body());
            }
        }
    }

    fn disconnect(&self, id: ConnId) {
        if let Some(conn) = self.conns.get(&id) {
            if let Some(transport) = &conn.transport {
                transport.lose_connection();
            }
        }
    }

    fn maybe_immediate_rechoke(&mut self, id: ConnId) {
        if self.conns.get(&id).is_some_and(|c| !c.local_choking) {
            self.tick_rechoke();
        }
    }

    // -- choker timers, driven externally (§4.8, every 10s / 30s) ---

    /// Reevaluate upload slots across every connection. Called from an
    /// external 10-second tick, or immediately after an interest
    /// change on an already-unchoked connection.
    pub fn tick_rechoke(&mut self) {
        let mut targets: HashMap<ConnId, &mut dyn ChokeTarget> = HashMap::new();
        for (id, conn) in &mut self.conns {
            targets.insert(*id, conn as &mut dyn ChokeTarget);
        }
        self.choker.rechoke(&mut targets);
        for conn in self.conns.values_mut() {
            conn.download_rate = 0.0;
        }
    }

    /// Rotate one choked, interested connection to the front of the
    /// choker's order. Called from an external 30-second tick.
    pub fn tick_optimistic_unchoke(&mut self) {
        let mut targets: HashMap<ConnId, &mut dyn ChokeTarget> = HashMap::new();
        for (id, conn) in &mut self.conns {
            targets.insert(*id, conn as &mut dyn ChokeTarget);
        }
        self.choker.optimistic_unchoke(&targets);
    }
}

/// Builds [`super::connection::Connection`]s for paths that terminate
/// on this torrent's query id.
pub struct BtFactory<S: Storage> {
    q: Q,
    shared: Arc<Mutex<BtController<S>>>,
}

impl<S: Storage> BtFactory<S> {
    /// Serve `shared`'s torrent for probes addressed to `q`.
    #[must_use]
    pub fn new(q: Q, shared: Arc<Mutex<BtController<S>>>) -> Self {
        Self { q, shared }
    }
}

impl<S: Storage + 'static> TenantFactory for BtFactory<S> {
    fn terminates_probe(&self, q: &Q) -> bool {
        *q == self.q
    }

    fn build_protocol(&self, address: &Address) -> Option<Box<dyn Protocol>> {
        let id: ConnId = (address.friend, address.pid, address.cid);
        Some(Box::new(super::connection::Connection::new(id, self.shared.clone())))
    }
}
