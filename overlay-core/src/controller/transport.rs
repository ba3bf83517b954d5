//! The tenant-facing surface of an established virtual path (§4.6).
//!
//! A [`Transport`] is handed to a tenant protocol once a path
//! terminates or is bound on the way through; it is the only thing a
//! tenant (e.g. the BT exchange) ever touches. Sending drops straight
//! to the underlying [`LinkHandle`]; tearing the path down goes back
//! through the controller's own command channel, since only the
//! controller may mutate its `transports`/routing state.

use overlay_proto::message::{Address, Frame};
use tokio::sync::mpsc;

use crate::link::LinkHandle;

use super::ControllerCommand;

/// A bound virtual path, handed to a tenant protocol.
#[derive(Clone)]
pub struct Transport {
    /// This path's full address (query, pid, cid, and the friend it
    /// terminates on or forwards from).
    pub address: Address,
    link: LinkHandle,
    commands: mpsc::UnboundedSender<ControllerCommand>,
}

impl Transport {
    pub(crate) fn new(
        address: Address,
        link: LinkHandle,
        commands: mpsc::UnboundedSender<ControllerCommand>,
    ) -> Self {
        Self { address, link, commands }
    }

    /// Send an application message over this path.
    pub fn send_message(&self, opcode: u8, body: Vec<u8>) {
        if let Ok(frame) = Frame::app(self.address.pid, self.address.cid, opcode, body) {
            self.link.send_frame(None, frame);
        }
    }

    /// Tear down this path: the controller sends `RESET` on the link
    /// and forgets the transport.
    pub fn lose_connection(&self) {
        let _ = self.commands.send(ControllerCommand::LoseConnection {
            link: self.link.friend.digest,
            pid: self.address.pid,
            cid: self.address.cid,
        });
    }
}

/// A tenant protocol instance bound to one [`Transport`].
pub trait Protocol: Send {
    /// Deliver an application-layer message.
    fn message_received(&mut self, opcode: u8, body: &[u8]);

    /// The path is ready; `transport` is this protocol's only way to
    /// send from now on.
    fn make_connection(&mut self, transport: Transport);

    /// The path was torn down, locally or by the peer.
    fn connection_lost(&mut self);
}

/// Builds tenant protocols for paths this node terminates or binds on
/// the way through.
pub trait TenantFactory: Send + Sync {
    /// Whether this node is a valid termination point for `q`.
    fn terminates_probe(&self, q: &overlay_proto::ids::Q) -> bool;

    /// Build a protocol instance for `address`, or refuse it.
    fn build_protocol(&self, address: &Address) -> Option<Box<dyn Protocol>>;
}
