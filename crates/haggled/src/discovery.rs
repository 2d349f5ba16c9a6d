//! UDP beacon neighbor discovery
//!
//! One task per connectivity manager: it broadcasts a beacon for every
//! local ethernet/wifi interface on each tick, tracks remote interfaces
//! heard on the beacon socket, and expires them when their beacon-derived
//! lifetime passes. Beacon ticks jitter by up to one second in either
//! direction so colliding nodes drift apart.

use crate::event::{Event, EventData, EventType};
use crate::interface_store::AgingPolicy;
use crate::kernel::KernelCore;
use haggle_core::{Address, Interface, InterfaceKey, InterfaceKind};
use haggle_net::beacon::{Beacon, BEACON_LEN};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Identifiers an administrator has banned, shared with the connectivity
/// manager
pub type Blacklist = Arc<Mutex<HashSet<(InterfaceKind, Vec<u8>)>>>;

/// Commands from the connectivity manager
pub enum DiscoveryCommand {
    AddLocalInterface(haggle_core::InterfaceRef),
    RemoveLocalInterface(InterfaceKey),
    SetBeaconInterval(Duration),
    /// Tear down a blacklisted neighbor interface immediately
    Expire(InterfaceKey),
    Shutdown,
}

pub struct Discovery {
    core: Arc<KernelCore>,
    socket: UdpSocket,
    locals: HashMap<InterfaceKey, haggle_core::InterfaceRef>,
    blacklist: Blacklist,
    seqno: u32,
    interval: Duration,
    rx: mpsc::UnboundedReceiver<DiscoveryCommand>,
    port: u16,
}

impl Discovery {
    /// Start the discovery task; the beacon socket is bound inside it so
    /// callers on the kernel thread never block
    pub fn spawn(
        core: Arc<KernelCore>,
        blacklist: Blacklist,
        interval: Duration,
        port: u16,
        rx: mpsc::UnboundedReceiver<DiscoveryCommand>,
    ) {
        tokio::spawn(async move {
            let socket =
                match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("could not bind beacon socket on port {}: {}", port, e);
                        return;
                    }
                };
            if let Err(e) = socket.set_broadcast(true) {
                warn!("could not enable broadcast: {}", e);
            }
            let discovery = Discovery {
                core,
                socket,
                locals: HashMap::new(),
                blacklist,
                seqno: 0,
                interval,
                rx,
                port,
            };
            discovery.run().await;
        });
    }

    async fn run(mut self) {
        info!("neighbor discovery on udp port {}", self.port);
        let mut buf = [0u8; 64];
        let mut next_beacon = Instant::now();
        let mut age_deadline: Option<Instant> = None;

        loop {
            let age_wait = {
                let deadline = age_deadline;
                async move {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending::<()>().await,
                    }
                }
            };

            tokio::select! {
                _ = tokio::time::sleep_until(next_beacon) => {
                    self.emit_beacons().await;
                    next_beacon = Instant::now() + self.jittered_interval();
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            if let Some(deadline) = self.handle_beacon(&buf[..len], src) {
                                age_deadline = Some(match age_deadline {
                                    Some(d) => d.min(deadline),
                                    None => deadline,
                                });
                            }
                        }
                        Err(e) => warn!("beacon recv: {}", e),
                    }
                }
                _ = age_wait => {
                    age_deadline = self.sweep();
                }
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(DiscoveryCommand::AddLocalInterface(iface)) => {
                            let key = iface.read().key();
                            self.locals.insert(key, iface);
                        }
                        Some(DiscoveryCommand::RemoveLocalInterface(key)) => {
                            self.locals.remove(&key);
                            for iface in self.core.interface_store().remove_children(&key) {
                                self.core.post(Event::with_data(
                                    EventType::NeighborInterfaceDown,
                                    EventData::Interface(iface),
                                ));
                            }
                            if self.locals.is_empty() {
                                info!("no local interfaces left, discovery terminating");
                                break;
                            }
                        }
                        Some(DiscoveryCommand::SetBeaconInterval(interval)) => {
                            info!("beacon interval set to {:?}", interval);
                            self.interval = interval;
                            next_beacon = Instant::now();
                        }
                        Some(DiscoveryCommand::Expire(key)) => {
                            if let Some(iface) = self.core.interface_store().remove(&key) {
                                self.core.post(Event::with_data(
                                    EventType::NeighborInterfaceDown,
                                    EventData::Interface(iface),
                                ));
                            }
                        }
                        Some(DiscoveryCommand::Shutdown) | None => break,
                    }
                }
            }
        }
        debug!("discovery task exiting");
    }

    fn jittered_interval(&self) -> Duration {
        jittered(self.interval)
    }

    async fn emit_beacons(&mut self) {
        self.seqno = self.seqno.wrapping_add(1);
        let interval_secs = self.interval.as_secs().min(u8::MAX as u64) as u8;
        let dest = SocketAddr::from((Ipv4Addr::BROADCAST, self.port));

        for iface in self.locals.values() {
            let Some(mac) = iface.read().mac() else {
                continue;
            };
            let beacon = Beacon::new(self.seqno, interval_secs, mac);
            if let Err(e) = self.socket.send_to(&beacon.encode(), dest).await {
                debug!("beacon send on {}: {}", iface.read().name(), e);
            }
        }
    }

    /// Returns the new interface's deadline when one was tracked
    fn handle_beacon(&mut self, bytes: &[u8], src: SocketAddr) -> Option<Instant> {
        if bytes.len() != BEACON_LEN {
            debug!("ignoring malformed beacon ({} bytes) from {}", bytes.len(), src);
            return None;
        }
        let beacon = match Beacon::decode(bytes) {
            Ok(b) => b,
            Err(e) => {
                debug!("ignoring beacon from {}: {}", src, e);
                return None;
            }
        };

        // Our own broadcast echoed back
        if self
            .locals
            .values()
            .any(|i| i.read().mac() == Some(beacon.mac))
        {
            return None;
        }

        if self
            .blacklist
            .lock()
            .contains(&(InterfaceKind::Ethernet, beacon.mac.to_vec()))
        {
            debug!("ignoring beacon from blacklisted {:02x?}", beacon.mac);
            return None;
        }

        let deadline = Instant::now() + beacon.lifetime();
        let parent = self.locals.keys().next().cloned();

        let mut iface = Interface::ethernet(beacon.mac, "remote");
        iface.add_address(Address::EthMac(beacon.mac));
        match src.ip() {
            IpAddr::V4(v4) => iface.add_address(Address::Ipv4(v4)),
            IpAddr::V6(v6) => iface.add_address(Address::Ipv6(v6)),
        }

        let (iface_ref, added) = self.core.interface_store().add_or_update(
            iface,
            parent,
            AgingPolicy::AbsoluteTime(deadline),
        );
        if added {
            info!(
                "neighbor interface up: {:02x?} at {} (seqno {}, lifetime {:?})",
                beacon.mac,
                src,
                beacon.seqno,
                beacon.lifetime()
            );
            self.core.post(Event::with_data(
                EventType::NeighborInterfaceUp,
                EventData::Interface(iface_ref),
            ));
        }
        Some(deadline)
    }

    /// Expire interfaces past their deadline; returns the next deadline
    fn sweep(&mut self) -> Option<Instant> {
        sweep_interfaces(&self.core)
    }
}

/// Uniform jitter in (-1 s, +1 s), drawn in microseconds the same way legacy
/// nodes do (half-open at the positive boundary)
fn jittered(interval: Duration) -> Duration {
    let jitter_us: i64 = rand::thread_rng().gen_range(-1_000_000..1_000_000);
    let base = interval.as_micros() as i64 + jitter_us;
    Duration::from_micros(base.max(0) as u64)
}

fn sweep_interfaces(core: &Arc<KernelCore>) -> Option<Instant> {
    let (dead, next) = core.interface_store().age(None, Instant::now());
    for iface in dead {
        info!("neighbor interface expired: {}", iface.read().key());
        core.post(Event::with_data(
            EventType::NeighborInterfaceDown,
            EventData::Interface(iface),
        ));
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_core::Node;

    fn test_core() -> Arc<KernelCore> {
        let node = Node::this_node("disc-test", &[[2, 0, 0, 0, 1, 1]]).into_ref();
        KernelCore::new(node, std::env::temp_dir())
    }

    fn test_discovery(core: Arc<KernelCore>) -> Discovery {
        let (_, rx) = mpsc::unbounded_channel();
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        Discovery {
            core,
            socket: UdpSocket::from_std(socket).unwrap(),
            locals: HashMap::new(),
            blacklist: Blacklist::default(),
            seqno: 0,
            interval: Duration::from_secs(2),
            rx,
            port: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_beacon_tracks_neighbor_and_expires() {
        let core = test_core();
        let mut discovery = test_discovery(core.clone());

        let peer_mac = [2u8, 0, 0, 0, 2, 2];
        let beacon = Beacon::new(1, 2, peer_mac);
        let src: SocketAddr = "192.168.1.9:9697".parse().unwrap();

        let deadline = discovery.handle_beacon(&beacon.encode(), src);
        assert!(deadline.is_some());
        assert_eq!(core.interface_store().len(), 1);

        let ev = core.queue().next().await;
        assert_eq!(ev.etype, EventType::NeighborInterfaceUp);
        assert_eq!(ev.interface().unwrap().read().mac(), Some(peer_mac));

        // Re-beacon refreshes without a second up event
        discovery.handle_beacon(&beacon.encode(), src);
        assert!(core.queue().is_empty());

        // Past the (2 + 1) * 3 = 9 s lifetime the sweep expires it
        tokio::time::advance(Duration::from_secs(10)).await;
        let next = discovery.sweep();
        assert_eq!(next, None);
        let ev = core.queue().next().await;
        assert_eq!(ev.etype, EventType::NeighborInterfaceDown);
        assert_eq!(core.interface_store().len(), 0);
    }

    #[tokio::test]
    async fn test_own_echo_and_blacklist_ignored() {
        let core = test_core();
        let mut discovery = test_discovery(core.clone());

        let own_mac = [2u8, 0, 0, 0, 1, 1];
        let own = Interface::ethernet(own_mac, "eth0").into_ref();
        discovery.locals.insert(own.read().key(), own.clone());

        let src: SocketAddr = "192.168.1.9:9697".parse().unwrap();
        assert!(discovery
            .handle_beacon(&Beacon::new(1, 2, own_mac).encode(), src)
            .is_none());

        let banned_mac = [2u8, 0, 0, 0, 3, 3];
        discovery
            .blacklist
            .lock()
            .insert((InterfaceKind::Ethernet, banned_mac.to_vec()));
        assert!(discovery
            .handle_beacon(&Beacon::new(1, 2, banned_mac).encode(), src)
            .is_none());
        assert_eq!(core.interface_store().len(), 0);
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..200 {
            let next = jittered(Duration::from_secs(5));
            assert!(next >= Duration::from_secs(4));
            assert!(next < Duration::from_secs(6));
        }
    }
}
