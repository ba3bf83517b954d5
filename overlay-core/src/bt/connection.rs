//! Per-path [`Protocol`] adapter binding one virtual path into a
//! shared [`BtController`] (§4.8).
//!
//! `OverlayController` owns exactly one `Box<dyn Protocol>` per bound
//! path and drives it from its own single task, so a `Connection` is
//! deliberately thin: every call just locks the shared controller and
//! forwards. The lock is uncontended in the common case since the
//! overlay controller itself never calls two `Protocol` methods
//! concurrently, but several connections sharing one torrent can each
//! be called from different paths' delivery, so the mutex is real.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::controller::transport::{Protocol, Transport};

use super::controller::BtController;
use super::storage::Storage;
use super::ConnId;

/// One virtual path's [`Protocol`] binding into a shared torrent.
pub struct Connection<S: Storage> {
    id: ConnId,
    shared: Arc<Mutex<BtController<S>>>,
}

impl<S: Storage> Connection<S> {
    #[must_use]
    pub fn new(id: ConnId, shared: Arc<Mutex<BtController<S>>>) -> Self {
        Self { id, shared }
    }
}

impl<S: Storage + 'static> Protocol for Connection<S> {
    fn message_received(&mut self, opcode: u8, body: &[u8]) {
        self.shared.lock().on_message(self.id, opcode, body);
    }

    fn make_connection(&mut self, transport: Transport) {
        self.shared.lock().connection_made(self.id, transport);
    }

    fn connection_lost(&mut self) {
        self.shared.lock().connection_lost(self.id);
    }
}
