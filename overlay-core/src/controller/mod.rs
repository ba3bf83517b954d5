//! The Overlay Controller: the routing brain of one node (§4.6).
//!
//! Every PROBE, ESTABLISH, RESET, and application message this node's
//! links receive is funneled into [`OverlayController::handle`]
//! through a single `mpsc` inbox, so all controller-state mutation is
//! strictly sequential — matching the teacher's `net.rs` supervisor
//! task shape rather than a `Mutex` shared across link tasks. Link I/O
//! itself still runs concurrently, one task per link.

pub mod probe_manager;
pub mod probe_table;
pub mod routing_table;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use overlay_proto::ids::{Cid, Digest, Pid, Q, Sid};
use overlay_proto::message::{Address, Frame};
use tokio::sync::mpsc;

use crate::link::{LinkEvent, LinkHandle};

use probe_manager::{ProbeManager, ProbeManagerRegistry};
use probe_table::ProbeTable;
use routing_table::RoutingTable;
use transport::{Protocol, TenantFactory, Transport};

const PROBE_TABLE_INTERVAL: Duration = Duration::from_secs(15);
const ROUTING_TABLE_INTERVAL: Duration = Duration::from_secs(30);

/// Errors raised while routing overlay control traffic.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControllerError {
    /// A probe's `sid` was already registered in the probe table.
    #[error("duplicate probe sid")]
    DuplicateProbe,
    /// A routing table lookup found no pair for `(link, pid)`.
    #[error("no route for path")]
    NoRoute,
}

struct TransportEntry {
    address: Address,
    link: LinkHandle,
    protocol: Option<Box<dyn Protocol>>,
}

/// Commands driving the controller's actor loop. Every link task, the
/// probe/prune timers, and bound [`Transport`]s funnel into this inbox.
pub enum ControllerCommand {
    /// A frame arrived, or a link was lost.
    Link(LinkEvent),
    /// A direct link to a friend came up.
    ConnectionEstablished(LinkHandle),
    /// A tenant voluntarily tore down its path.
    LoseConnection {
        /// The friend the path ran over.
        link: Digest,
        /// The path id on that link.
        pid: Pid,
        /// The path's channel id.
        cid: Cid,
    },
    /// Run one probe-table pruning pass.
    PruneProbeTable,
    /// Run one routing-table pruning pass.
    PruneRoutingTable,
    /// Run one probe-flood cycle for every registered manager.
    ProbeTick,
}

/// The routing brain of one overlay node.
pub struct OverlayController {
    id: String,
    connections: HashMap<Digest, LinkHandle>,
    ptable: ProbeTable,
    rtable: RoutingTable,
    transports: HashMap<Digest, HashMap<(Pid, Cid), TransportEntry>>,
    managers: ProbeManagerRegistry,
    factory: Arc<dyn TenantFactory>,
    commands: mpsc::UnboundedSender<ControllerCommand>,
}

impl OverlayController {
    /// Build a controller. `commands` is the sender half of its own
    /// inbox; it is cloned into every [`Transport`] so tenants can ask
    /// for a path to be torn down without touching controller state
    /// directly.
    #[must_use]
    pub fn new(id: String, factory: Arc<dyn TenantFactory>, commands: mpsc::UnboundedSender<ControllerCommand>) -> Self {
        Self {
            id,
            connections: HashMap::new(),
            ptable: ProbeTable::new(PROBE_TABLE_INTERVAL),
            rtable: RoutingTable::new(),
            transports: HashMap::new(),
            managers: ProbeManagerRegistry::new(),
            factory,
            commands,
        }
    }

    /// Register a probe manager for `q`; this node will flood probes
    /// for it on every [`ControllerCommand::ProbeTick`].
    pub fn register_probe_manager(&mut self, q: Q) {
        self.managers.register(ProbeManager::new(q));
    }

    /// Drain `inbox` forever, applying each command in turn.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ControllerCommand>) {
        while let Some(cmd) = inbox.recv().await {
            self.handle(cmd);
        }
    }

    /// Apply a single command to the controller's state.
    pub fn handle(&mut self, cmd: ControllerCommand) {
        match cmd {
            ControllerCommand::Link(LinkEvent::FrameReceived { link, frame }) => {
                self.received_frame(link, frame);
            }
            ControllerCommand::Link(LinkEvent::Lost { digest }) => self.connection_lost(&digest),
            ControllerCommand::ConnectionEstablished(link) => {
                self.connections.insert(link.friend.digest, link);
            }
            ControllerCommand::LoseConnection { link, pid, cid } => {
                self.lose_connection(&link, pid, cid);
            }
            ControllerCommand::PruneProbeTable => self.ptable.prune(),
            ControllerCommand::PruneRoutingTable => self.rtable.prune(ROUTING_TABLE_INTERVAL),
            ControllerCommand::ProbeTick => self.managers.tick(&self.connections),
        }
    }

    fn received_frame(&mut self, source: LinkHandle, frame: Frame) {
        match frame {
            Frame::Probe { q, cid, sid, ttl } => self.received_probe(q, cid, sid, ttl, source),
            Frame::Establish { pid, cid, sid } => self.received_establish(pid, cid, sid, source),
            Frame::Reset { pid, cid } => self.received_reset(pid, cid, source),
            Frame::App { pid, cid, opcode, body } => self.received_app_message(pid, cid, opcode, &body, source),
        }
    }

    fn received_probe(&mut self, q: Q, cid: Cid, sid: Sid, ttl: u8, source: LinkHandle) {
        if self.managers.contains_sid(&sid) {
            // Our own probe, flooded back to us.
            return;
        }
        if self.factory.terminates_probe(&q) {
            self.terminate_probe(q, cid, sid, source);
            return;
        }
        if !(2..=15).contains(&ttl) {
            return;
        }
        if self.ptable.add(sid, source.clone()).is_ok() {
            self.relay_probe(q, cid, sid, ttl, &source);
        }
    }

    fn terminate_probe(&mut self, q: Q, cid: Cid, sid: Sid, source: LinkHandle) {
        let pid = Pid::terminate(&q, &source.connection_id);
        let digest = source.friend.digest;
        let already_bound = self
            .transports
            .get(&digest)
            .is_some_and(|paths| paths.contains_key(&(pid, cid)));
        if already_bound {
            source.send_frame(None, Frame::Establish { pid, cid, sid });
            return;
        }
        let address = Address { q, pid, cid, friend: digest };
        let entry = TransportEntry { address, link: source.clone(), protocol: None };
        self.transports.entry(digest).or_default().insert((pid, cid), entry);
        source.send_frame(None, Frame::Establish { pid, cid, sid });
    }

    fn relay_probe(&self, q: Q, cid: Cid, sid: Sid, ttl: u8, source: &LinkHandle) {
        for target in self.connections.values() {
            if target.friend.digest == source.friend.digest {
                continue;
            }
            target.send_frame(Some(source.friend.digest), Frame::Probe { q, cid, sid, ttl: ttl - 1 });
        }
    }

    fn received_establish(&mut self, pid: Pid, cid: Cid, sid: Sid, source: LinkHandle) {
        if let Some(q) = self.managers.q_for_sid(&sid) {
            self.accept_establish(q, pid, cid, source);
            return;
        }
        let Some(target) = self.ptable.get(&sid).cloned() else {
            return;
        };
        let target_pid = Pid::forward(&pid, &target.connection_id);
        self.rtable.add(&source, pid, &target, target_pid);
        target.send_frame(Some(source.friend.digest), Frame::Establish { pid: target_pid, cid, sid });
    }

    fn accept_establish(&mut self, q: Q, pid: Pid, cid: Cid, source: LinkHandle) {
        let digest = source.friend.digest;
        if self.transports.get(&digest).is_some_and(|paths| paths.contains_key(&(pid, cid))) {
            return;
        }
        let address = Address { q, pid, cid, friend: digest };
        let Some(mut protocol) = self.factory.build_protocol(&address) else {
            source.send_frame(None, Frame::Reset { pid, cid });
            return;
        };
        let transport = Transport::new(address, source.clone(), self.commands.clone());
        protocol.make_connection(transport);
        let entry = TransportEntry { address, link: source, protocol: Some(protocol) };
        self.transports.entry(digest).or_default().insert((pid, cid), entry);
    }

    fn received_app_message(&mut self, pid: Pid, cid: Cid, opcode: u8, body: &[u8], source: LinkHandle) {
        let digest = source.friend.digest;
        if self.transports.get(&digest).is_some_and(|paths| paths.contains_key(&(pid, cid))) {
            self.deliver_app_message(digest, pid, cid, opcode, body, &source);
            return;
        }
        match self.rtable.get(&digest, &pid) {
            Ok((target, target_pid)) => {
                if let Ok(frame) = Frame::app(target_pid, cid, opcode, body.to_vec()) {
                    target.send_frame(Some(digest), frame);
                }
            }
            Err(_) => source.send_frame(None, Frame::Reset { pid, cid }),
        }
    }

    fn deliver_app_message(&mut self, digest: Digest, pid: Pid, cid: Cid, opcode: u8, body: &[u8], source: &LinkHandle) {
        let Some(paths) = self.transports.get_mut(&digest) else { return };
        let Some(entry) = paths.get_mut(&(pid, cid)) else { return };
        if entry.protocol.is_none() {
            let Some(mut protocol) = self.factory.build_protocol(&entry.address) else {
                paths.remove(&(pid, cid));
                source.send_frame(None, Frame::Reset { pid, cid });
                return;
            };
            let transport = Transport::new(entry.address, source.clone(), self.commands.clone());
            protocol.make_connection(transport);
            entry.protocol = Some(protocol);
        }
        if let Some(protocol) = entry.protocol.as_mut() {
            protocol.message_received(opcode, body);
        }
    }

    fn received_reset(&mut self, pid: Pid, cid: Cid, source: LinkHandle) {
        let digest = source.friend.digest;
        if let Some(paths) = self.transports.get_mut(&digest) {
            if let Some(mut entry) = paths.remove(&(pid, cid)) {
                if let Some(mut protocol) = entry.protocol.take() {
                    protocol.connection_lost();
                }
                return;
            }
        }
        if let Some((other_link, other_pid)) = self.rtable.delete(&digest, &pid) {
            other_link.send_frame(Some(digest), Frame::Reset { pid: other_pid, cid });
        }
    }

    fn lose_connection(&mut self, digest: &Digest, pid: Pid, cid: Cid) {
        if let Some(paths) = self.transports.get_mut(digest) {
            if let Some(mut entry) = paths.remove(&(pid, cid)) {
                entry.link.send_frame(None, Frame::Reset { pid, cid });
                if let Some(mut protocol) = entry.protocol.take() {
                    protocol.connection_lost();
                }
            }
        }
    }

    fn connection_lost(&mut self, digest: &Digest) {
        tracing::debug!(node = %self.id, friend = ?digest, "link lost");
        self.connections.remove(digest);
        self.ptable.connection_lost(digest);
        self.rtable.connection_lost(digest);
        if let Some(paths) = self.transports.remove(digest) {
            for (_, mut entry) in paths {
                if let Some(mut protocol) = entry.protocol.take() {
                    protocol.connection_lost();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::friend::Friend;
    use overlay_proto::ids::ConnectionId;
    use parking_lot::Mutex;
    use std::sync::Arc as StdArc;

    fn link(byte: u8) -> LinkHandle {
        let friend = Friend::from_cert(vec![byte], None);
        let (tx, _rx) = mpsc::unbounded_channel();
        LinkHandle::new(friend, ConnectionId::random(), tx)
    }

    fn link_with_rx(byte: u8) -> (LinkHandle, mpsc::UnboundedReceiver<crate::link::LinkOutbound>) {
        let friend = Friend::from_cert(vec![byte], None);
        let (tx, rx) = mpsc::unbounded_channel();
        (LinkHandle::new(friend, ConnectionId::random(), tx), rx)
    }

    struct AlwaysTerminates {
        built: StdArc<Mutex<Vec<Address>>>,
        refuse: bool,
    }

    impl TenantFactory for AlwaysTerminates {
        fn terminates_probe(&self, _q: &Q) -> bool {
            true
        }
        fn build_protocol(&self, address: &Address) -> Option<Box<dyn Protocol>> {
            if self.refuse {
                return None;
            }
            self.built.lock().push(*address);
            Some(Box::new(NullProtocol))
        }
    }

    struct NeverTerminates;
    impl TenantFactory for NeverTerminates {
        fn terminates_probe(&self, _q: &Q) -> bool {
            false
        }
        fn build_protocol(&self, _address: &Address) -> Option<Box<dyn Protocol>> {
            None
        }
    }

    struct NullProtocol;
    impl Protocol for NullProtocol {
        fn message_received(&mut self, _opcode: u8, _body: &[u8]) {}
        fn make_connection(&mut self, _transport: Transport) {}
        fn connection_lost(&mut self) {}
    }

    fn controller(factory: Arc<dyn TenantFactory>) -> OverlayController {
        let (tx, _rx) = mpsc::unbounded_channel();
        OverlayController::new("test".into(), factory, tx)
    }

    #[test]
    fn terminating_node_sends_establish_and_binds_transport() {
        let built = StdArc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(AlwaysTerminates { built: built.clone(), refuse: false });
        let mut c = controller(factory);
        let (source, mut rx) = link_with_rx(1);
        let q = Q::random();
        let cid = Cid::random();
        let sid = Sid::random();

        c.received_probe(q, cid, sid, 10, source.clone());

        let expected_pid = Pid::terminate(&q, &source.connection_id);
        assert!(c.transports.get(&source.friend.digest).unwrap().contains_key(&(expected_pid, cid)));
        match rx.try_recv().unwrap() {
            crate::link::LinkOutbound::Frame { frame: Frame::Establish { pid, cid: c2, sid: s2 }, .. } => {
                assert_eq!(pid, expected_pid);
                assert_eq!(c2, cid);
                assert_eq!(s2, sid);
            }
            _ => panic!("expected Establish frame"),
        }
    }

    #[test]
    fn repeated_probe_for_same_path_resends_establish_idempotently() {
        let factory = Arc::new(AlwaysTerminates { built: StdArc::new(Mutex::new(Vec::new())), refuse: false });
        let mut c = controller(factory);
        let (source, mut rx) = link_with_rx(1);
        let q = Q::random();
        let cid = Cid::random();
        let sid1 = Sid::random();
        let sid2 = Sid::random();

        c.received_probe(q, cid, sid1, 10, source.clone());
        rx.try_recv().unwrap();
        c.received_probe(q, cid, sid2, 10, source.clone());
        assert!(rx.try_recv().is_ok());
        assert_eq!(c.transports.get(&source.friend.digest).unwrap().len(), 1);
    }

    #[test]
    fn probe_with_ttl_out_of_range_is_dropped() {
        let factory = Arc::new(NeverTerminates);
        let mut c = controller(factory);
        let (source, _rx) = link_with_rx(1);
        c.received_probe(Q::random(), Cid::random(), Sid::random(), 1, source);
        assert!(c.ptable.get(&Sid::random()).is_none());
    }

    #[test]
    fn intermediate_relays_to_every_link_but_source() {
        let factory = Arc::new(NeverTerminates);
        let mut c = controller(factory);
        let (source, _source_rx) = link_with_rx(1);
        let (other, mut other_rx) = link_with_rx(2);
        c.connections.insert(source.friend.digest, source.clone());
        c.connections.insert(other.friend.digest, other.clone());

        let q = Q::random();
        let cid = Cid::random();
        let sid = Sid::random();
        c.received_probe(q, cid, sid, 10, source.clone());

        match other_rx.try_recv().unwrap() {
            crate::link::LinkOutbound::Frame { frame: Frame::Probe { ttl, .. }, flow } => {
                assert_eq!(ttl, 9);
                assert_eq!(flow, Some(source.friend.digest));
            }
            _ => panic!("expected relayed Probe"),
        }
        assert!(c.ptable.get(&sid).is_some());
    }

    #[test]
    fn duplicate_probe_sid_is_dropped_silently() {
        let factory = Arc::new(NeverTerminates);
        let mut c = controller(factory);
        let (source, _rx) = link_with_rx(1);
        let (other, _other_rx) = link_with_rx(2);
        c.connections.insert(other.friend.digest, other);

        let q = Q::random();
        let cid = Cid::random();
        let sid = Sid::random();
        c.received_probe(q, cid, sid, 10, source.clone());
        c.received_probe(q, cid, sid, 10, source);
        // No panic, no duplicate registration; ptable still has exactly one entry.
        assert!(c.ptable.get(&sid).is_some());
    }

    #[test]
    fn establish_with_no_matching_probe_is_dropped() {
        let factory = Arc::new(NeverTerminates);
        let mut c = controller(factory);
        let (source, _rx) = link_with_rx(1);
        c.received_establish(Pid::random(), Cid::random(), Sid::random(), source);
        // No panic; nothing in rtable.
    }

    #[test]
    fn intermediate_establish_builds_route_and_forwards() {
        let factory = Arc::new(NeverTerminates);
        let mut c = controller(factory);
        let (upstream, mut upstream_rx) = link_with_rx(1);
        let (downstream, _downstream_rx) = link_with_rx(2);

        let q = Q::random();
        let cid = Cid::random();
        let sid = Sid::random();
        c.ptable.add(sid, upstream.clone()).unwrap();

        let pid = Pid::random();
        c.received_establish(pid, cid, sid, downstream.clone());

        let expected_forward_pid = Pid::forward(&pid, &upstream.connection_id);
        match upstream_rx.try_recv().unwrap() {
            crate::link::LinkOutbound::Frame { frame: Frame::Establish { pid: fpid, .. }, .. } => {
                assert_eq!(fpid, expected_forward_pid);
            }
            _ => panic!("expected forwarded Establish"),
        }
        let (routed_link, routed_pid) = c.rtable.get(&downstream.friend.digest, &pid).unwrap();
        assert_eq!(routed_link.friend.digest, upstream.friend.digest);
        assert_eq!(routed_pid, expected_forward_pid);
        let _ = q;
    }

    #[test]
    fn originator_establish_with_refusing_factory_sends_reset() {
        let built = StdArc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(AlwaysTerminates { built, refuse: true });
        let mut c = controller(factory);
        let q = Q::random();
        c.register_probe_manager(q);
        c.managers.tick(&HashMap::new());
        let sid = c.managers.current_sid_for(&q).unwrap();

        let (source, mut rx) = link_with_rx(1);
        let pid = Pid::random();
        let cid = Cid::random();
        c.received_establish(pid, cid, sid, source);
        match rx.try_recv().unwrap() {
            crate::link::LinkOutbound::Frame { frame: Frame::Reset { pid: rpid, .. }, .. } => {
                assert_eq!(rpid, pid);
            }
            _ => panic!("expected Reset frame"),
        }
    }

    #[test]
    fn app_message_on_bound_transport_is_delivered() {
        struct CountingProtocol(StdArc<Mutex<usize>>);
        impl Protocol for CountingProtocol {
            fn message_received(&mut self, _opcode: u8, _body: &[u8]) {
                *self.0.lock() += 1;
            }
            fn make_connection(&mut self, _transport: Transport) {}
            fn connection_lost(&mut self) {}
        }

        let factory = Arc::new(NeverTerminates);
        let mut c = controller(factory);
        let (source, _rx) = link_with_rx(1);
        let digest = source.friend.digest;
        let pid = Pid::random();
        let cid = Cid::random();
        let address = Address { q: Q::random(), pid, cid, friend: digest };
        let count = StdArc::new(Mutex::new(0));
        let entry = TransportEntry {
            address,
            link: source.clone(),
            protocol: Some(Box::new(CountingProtocol(count.clone()))),
        };
        c.transports.entry(digest).or_default().insert((pid, cid), entry);

        c.received_app_message(pid, cid, 200, &[1, 2, 3], source);
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn app_message_with_no_transport_or_route_triggers_reset() {
        let factory = Arc::new(NeverTerminates);
        let mut c = controller(factory);
        let (source, mut rx) = link_with_rx(1);
        let pid = Pid::random();
        let cid = Cid::random();
        c.received_app_message(pid, cid, 200, &[], source);
        match rx.try_recv().unwrap() {
            crate::link::LinkOutbound::Frame { frame: Frame::Reset { pid: rpid, .. }, .. } => {
                assert_eq!(rpid, pid);
            }
            _ => panic!("expected Reset frame"),
        }
    }

    #[test]
    fn app_message_forwards_through_routing_table() {
        let factory = Arc::new(NeverTerminates);
        let mut c = controller(factory);
        let (src, _src_rx) = link_with_rx(1);
        let (tgt, mut tgt_rx) = link_with_rx(2);
        let spid = Pid::random();
        let tpid = Pid::random();
        c.rtable.add(&src, spid, &tgt, tpid);

        c.received_app_message(spid, Cid::random(), 200, &[9], src.clone());
        match tgt_rx.try_recv().unwrap() {
            crate::link::LinkOutbound::Frame { frame: Frame::App { pid, opcode, body, .. }, flow } => {
                assert_eq!(pid, tpid);
                assert_eq!(opcode, 200);
                assert_eq!(body, vec![9]);
                assert_eq!(flow, Some(src.friend.digest));
            }
            _ => panic!("expected forwarded App frame"),
        }
    }

    #[test]
    fn reset_on_bound_transport_delivers_connection_lost() {
        struct LossProtocol(StdArc<Mutex<bool>>);
        impl Protocol for LossProtocol {
            fn message_received(&mut self, _opcode: u8, _body: &[u8]) {}
            fn make_connection(&mut self, _transport: Transport) {}
            fn connection_lost(&mut self) {
                *self.0.lock() = true;
            }
        }

        let factory = Arc::new(NeverTerminates);
        let mut c = controller(factory);
        let (source, _rx) = link_with_rx(1);
        let digest = source.friend.digest;
        let pid = Pid::random();
        let cid = Cid::random();
        let lost = StdArc::new(Mutex::new(false));
        let address = Address { q: Q::random(), pid, cid, friend: digest };
        c.transports.entry(digest).or_default().insert(
            (pid, cid),
            TransportEntry { address, link: source.clone(), protocol: Some(Box::new(LossProtocol(lost.clone()))) },
        );

        c.received_reset(pid, cid, source);
        assert!(*lost.lock());
        assert!(!c.transports.get(&digest).unwrap().contains_key(&(pid, cid)));
    }

    #[test]
    fn reset_with_no_transport_forwards_through_routing_table() {
        let factory = Arc::new(NeverTerminates);
        let mut c = controller(factory);
        let (src, _src_rx) = link_with_rx(1);
        let (tgt, mut tgt_rx) = link_with_rx(2);
        let spid = Pid::random();
        let tpid = Pid::random();
        c.rtable.add(&src, spid, &tgt, tpid);

        c.received_reset(spid, Cid::random(), src.clone());
        match tgt_rx.try_recv().unwrap() {
            crate::link::LinkOutbound::Frame { frame: Frame::Reset { pid, .. }, .. } => {
                assert_eq!(pid, tpid);
            }
            _ => panic!("expected forwarded Reset"),
        }
        assert!(c.rtable.get(&src.friend.digest, &spid).is_err());
    }

    #[test]
    fn connection_lost_purges_probe_routing_and_transport_state() {
        let factory = Arc::new(NeverTerminates);
        let mut c = controller(factory);
        let (source, _rx) = link_with_rx(1);
        let digest = source.friend.digest;
        c.connections.insert(digest, source.clone());
        c.ptable.add(Sid::random(), source.clone()).unwrap();

        struct LossProtocol(StdArc<Mutex<bool>>);
        impl Protocol for LossProtocol {
            fn message_received(&mut self, _opcode: u8, _body: &[u8]) {}
            fn make_connection(&mut self, _transport: Transport) {}
            fn connection_lost(&mut self) {
                *self.0.lock() = true;
            }
        }
        let lost = StdArc::new(Mutex::new(false));
        let pid = Pid::random();
        let cid = Cid::random();
        let address = Address { q: Q::random(), pid, cid, friend: digest };
        c.transports.entry(digest).or_default().insert(
            (pid, cid),
            TransportEntry { address, link: source, protocol: Some(Box::new(LossProtocol(lost.clone()))) },
        );

        c.connection_lost(&digest);
        assert!(*lost.lock());
        assert!(!c.connections.contains_key(&digest));
        assert!(!c.transports.contains_key(&digest));
    }

    #[test]
    fn unused_link_helper_compiles() {
        let _ = link(9);
    }
}
