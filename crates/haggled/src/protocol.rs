//! Protocol manager
//!
//! Routes `DataObjectSend` events to transports. Per target: elect an
//! interface (Ethernet over Wi-Fi over Bluetooth; applications go to their
//! application interface), translate its address family to a transport, and
//! enqueue on the one sender instance that exists per `(transport, peer
//! interface)`. Server instances bind when local interfaces come up and
//! spawn a receiver per accepted connection.

use crate::event::{Event, EventData, EventType, PrivateEventId};
use crate::kernel::KernelCore;
use crate::manager::Manager;
use crate::{protocol_tcp, protocol_udp};
use haggle_core::{DataObjectRef, InterfaceKey, InterfaceKind, NodeRef, NodeType};
use haggle_net::framing::{FrameError, FrameType};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Protocol-layer errors; a failed instance becomes a send failure, never a
/// manager failure
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("metadata error: {0}")]
    Metadata(#[from] haggle_core::Error),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("timed out")]
    Timeout,
    #[error("unexpected frame {0:?}")]
    UnexpectedFrame(FrameType),
    #[error("receiver rejected the payload")]
    Rejected,
    #[error("payload file missing")]
    MissingPayload,
    #[error("payload hash mismatch")]
    HashMismatch,
    #[error("no usable interface on target")]
    NoRoute,
}

/// One queued transmission
pub struct SendItem {
    pub dobj: DataObjectRef,
    pub target: NodeRef,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum TransportKind {
    Tcp,
    Udp,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct SenderKey {
    transport: TransportKind,
    peer: InterfaceKey,
}

struct SenderHandle {
    tx: mpsc::UnboundedSender<SendItem>,
    cancel: watch::Sender<bool>,
}

pub struct ProtocolManager {
    core: Arc<KernelCore>,
    tcp_port: u16,
    /// Deferred re-dispatch of DataObjectSend, one step after the public
    /// event so other managers may still mutate the object
    send_event: PrivateEventId,
    senders: HashMap<SenderKey, SenderHandle>,
    servers: HashMap<InterfaceKey, watch::Sender<bool>>,
}

impl ProtocolManager {
    pub fn new(core: Arc<KernelCore>, tcp_port: u16) -> ProtocolManager {
        let send_event = core.new_private_event();
        ProtocolManager {
            core,
            tcp_port,
            send_event,
            senders: HashMap::new(),
            servers: HashMap::new(),
        }
    }

    /// Elect the interface and transport for a target node
    fn route(&self, target: &NodeRef) -> Result<(TransportKind, InterfaceKey, SocketAddr), ProtocolError> {
        let node = target.read();
        let mut best: Option<(u8, TransportKind, InterfaceKey, SocketAddr)> = None;

        for iface_ref in node.interfaces() {
            let iface = iface_ref.read();
            if !iface.is_up() {
                continue;
            }
            let candidate = match iface.kind() {
                InterfaceKind::Ethernet | InterfaceKind::Wifi => {
                    let rank = if iface.kind() == InterfaceKind::Ethernet { 0 } else { 1 };
                    iface.first_ip().map(|ip| {
                        (
                            rank,
                            TransportKind::Tcp,
                            iface.key(),
                            SocketAddr::new(ip, self.tcp_port),
                        )
                    })
                }
                InterfaceKind::ApplicationPort => {
                    match (iface.first_ip(), iface.port()) {
                        (Some(ip), Some(port)) => Some((
                            0,
                            TransportKind::Udp,
                            iface.key(),
                            SocketAddr::new(ip, port),
                        )),
                        (None, Some(port)) => Some((
                            0,
                            TransportKind::Udp,
                            iface.key(),
                            SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port),
                        )),
                        _ => None,
                    }
                }
                // The RFCOMM and media drivers are external collaborators;
                // without one these interfaces are not routable
                InterfaceKind::Bluetooth | InterfaceKind::Media => None,
                _ => None,
            };
            if let Some(c) = candidate {
                best = match best {
                    Some(b) if b.0 <= c.0 => Some(b),
                    _ => Some(c),
                };
            }
        }

        best.map(|(_, t, k, a)| (t, k, a)).ok_or(ProtocolError::NoRoute)
    }

    fn send_to(&mut self, dobj: DataObjectRef, target: NodeRef) {
        let (transport, peer_key, addr) = match self.route(&target) {
            Ok(route) => route,
            Err(e) => {
                debug!(
                    "no route for {} to {}: {}",
                    dobj,
                    target.read().name(),
                    e
                );
                self.core.post(Event::with_data(
                    EventType::DataObjectSendFailure,
                    EventData::DataObjectAndNode(dobj, target),
                ));
                return;
            }
        };

        let key = SenderKey {
            transport,
            peer: peer_key,
        };
        let mut item = SendItem { dobj, target };

        // One sender instance per peer; recreate if the old one exited
        if let Some(handle) = self.senders.get(&key) {
            match handle.tx.send(item) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => item = returned,
            }
            self.senders.remove(&key);
        }
        self.spawn_sender(key, addr, item);
    }

    fn spawn_sender(&mut self, key: SenderKey, addr: SocketAddr, item: SendItem) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        match key.transport {
            TransportKind::Tcp => {
                tokio::spawn(protocol_tcp::run_sender(
                    self.core.clone(),
                    addr,
                    rx,
                    cancel_rx,
                ));
            }
            TransportKind::Udp => {
                tokio::spawn(protocol_udp::run_sender(
                    self.core.clone(),
                    addr,
                    rx,
                    cancel_rx,
                ));
            }
        }
        if tx.send(item).is_err() {
            warn!("freshly spawned sender refused work");
        }
        self.senders.insert(
            key,
            SenderHandle {
                tx,
                cancel: cancel_tx,
            },
        );
    }

    fn stop_sender(&mut self, key: &InterfaceKey) {
        let stale: Vec<SenderKey> = self
            .senders
            .keys()
            .filter(|k| k.peer == *key)
            .cloned()
            .collect();
        for k in stale {
            if let Some(handle) = self.senders.remove(&k) {
                let _ = handle.cancel.send(true);
            }
        }
    }
}

impl Manager for ProtocolManager {
    fn name(&self) -> &'static str {
        "protocol"
    }

    fn core(&self) -> &Arc<KernelCore> {
        &self.core
    }

    fn wants(&self, etype: &EventType) -> bool {
        match etype {
            EventType::DataObjectSend
            | EventType::LocalInterfaceUp
            | EventType::LocalInterfaceDown
            | EventType::NeighborInterfaceDown => true,
            EventType::Private(id) => *id == self.send_event,
            _ => false,
        }
    }

    fn on_event(&mut self, event: &Event) {
        match &event.etype {
            EventType::DataObjectSend => {
                // Re-dispatch privately one step later
                self.core.post(Event::with_data(
                    EventType::Private(self.send_event),
                    event.data.clone(),
                ));
            }
            EventType::Private(id) if *id == self.send_event => {
                if let EventData::DataObjectAndNodes(dobj, targets) = &event.data {
                    for target in targets {
                        // Never send to ourselves or to undefined placeholders
                        let skip = {
                            let node = target.read();
                            node.node_type() == NodeType::ThisNode
                                || node.id() == self.core.this_node().read().id()
                        };
                        if skip {
                            continue;
                        }
                        self.send_to(dobj.clone(), target.clone());
                    }
                }
            }
            EventType::LocalInterfaceUp => {
                if let Some(iface_ref) = event.interface() {
                    let iface = iface_ref.read();
                    if !matches!(iface.kind(), InterfaceKind::Ethernet | InterfaceKind::Wifi) {
                        return;
                    }
                    let Some(ip) = iface.first_ip() else {
                        warn!("local interface {} has no address to bind", iface.name());
                        return;
                    };
                    let key = iface.key();
                    drop(iface);
                    let (cancel_tx, cancel_rx) = watch::channel(false);
                    protocol_tcp::spawn_server(
                        self.core.clone(),
                        SocketAddr::new(ip, self.tcp_port),
                        key.clone(),
                        cancel_rx,
                    );
                    self.servers.insert(key, cancel_tx);
                }
            }
            EventType::LocalInterfaceDown => {
                if let Some(iface_ref) = event.interface() {
                    let key = iface_ref.read().key();
                    if let Some(cancel) = self.servers.remove(&key) {
                        let _ = cancel.send(true);
                    }
                }
            }
            EventType::NeighborInterfaceDown => {
                if let Some(iface_ref) = event.interface() {
                    let key = iface_ref.read().key();
                    self.stop_sender(&key);
                }
            }
            _ => {}
        }
    }

    fn on_prepare_shutdown(&mut self) {
        for (_, handle) in self.senders.drain() {
            let _ = handle.cancel.send(true);
        }
        for (_, cancel) in self.servers.drain() {
            let _ = cancel.send(true);
        }
        let core = self.core.clone();
        core.signal_ready_for_shutdown(self.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_core::{Address, Interface, Node};

    fn test_core() -> Arc<KernelCore> {
        let node = Node::this_node("pm-test", &[[2, 0, 0, 0, 5, 1]]).into_ref();
        KernelCore::new(node, std::env::temp_dir())
    }

    fn neighbor(macs: &[([u8; 6], InterfaceKind, &str, bool)]) -> NodeRef {
        let mut node = Node::this_node("peer", &[[2, 0, 0, 0, 5, 2]]);
        for (mac, kind, ip, up) in macs {
            let mut iface = match kind {
                InterfaceKind::Wifi => Interface::wifi(*mac, "wlan0"),
                _ => Interface::ethernet(*mac, "eth0"),
            };
            iface.add_address(Address::Ipv4(ip.parse().unwrap()));
            let iface = iface.into_ref();
            iface.write().set_up(*up);
            node.add_interface(iface);
        }
        node.into_ref()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_route_prefers_ethernet() {
        let manager = ProtocolManager::new(test_core(), 9697);
        let target = neighbor(&[
            ([2, 0, 0, 0, 6, 1], InterfaceKind::Wifi, "10.0.0.2", true),
            ([2, 0, 0, 0, 6, 2], InterfaceKind::Ethernet, "10.0.0.3", true),
        ]);
        let (transport, key, addr) = manager.route(&target).unwrap();
        assert_eq!(transport, TransportKind::Tcp);
        assert_eq!(key.kind, InterfaceKind::Ethernet);
        assert_eq!(addr, "10.0.0.3:9697".parse().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_route_skips_down_interfaces() {
        let manager = ProtocolManager::new(test_core(), 9697);
        let target = neighbor(&[
            ([2, 0, 0, 0, 6, 3], InterfaceKind::Ethernet, "10.0.0.4", false),
            ([2, 0, 0, 0, 6, 4], InterfaceKind::Wifi, "10.0.0.5", true),
        ]);
        let (_, key, _) = manager.route(&target).unwrap();
        assert_eq!(key.kind, InterfaceKind::Wifi);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_route_application() {
        let manager = ProtocolManager::new(test_core(), 9697);
        let mut node = Node::application("app");
        let iface = Interface::application_port(4711).into_ref();
        iface.write().set_up(true);
        node.add_interface(iface);
        let (transport, _, addr) = manager.route(&node.into_ref()).unwrap();
        assert_eq!(transport, TransportKind::Udp);
        assert_eq!(addr, "127.0.0.1:4711".parse().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_route_is_send_failure() {
        let core = test_core();
        let mut manager = ProtocolManager::new(core.clone(), 9697);
        let target = neighbor(&[(
            [2, 0, 0, 0, 6, 5],
            InterfaceKind::Ethernet,
            "10.0.0.6",
            false,
        )]);
        let dobj = haggle_core::DataObject::from_attributes(Default::default(), true).into_ref();
        manager.send_to(dobj, target);
        let ev = core.queue().next().await;
        assert_eq!(ev.etype, EventType::DataObjectSendFailure);
    }
}
