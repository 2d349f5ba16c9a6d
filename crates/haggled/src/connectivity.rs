//! Connectivity manager
//!
//! Reports the host's local link-layer interfaces, drives the beacon
//! discoverer, maps resource-policy changes onto the beacon interval and
//! enforces the administrator blacklist. Concrete link drivers are external
//! collaborators; local interfaces come from a config-supplied list or an
//! address-table probe.

use crate::discovery::{Blacklist, Discovery, DiscoveryCommand};
use crate::event::{Event, EventData, EventType, PrivateEventId};
use crate::interface_store::AgingPolicy;
use crate::kernel::KernelCore;
use crate::manager::Manager;
use crate::matching::Filter;
use haggle_core::interface::parse_mac;
use haggle_core::{
    Address, Attribute, AttributeSet, DataObjectRef, Interface, InterfaceKind, WILDCARD_VALUE,
};
use sha1::{Digest, Sha1};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Attribute name of administrator control objects
pub const CONNECTIVITY_ATTR: &str = "Connectivity";
const BLACKLIST_TAG: &str = "Blacklist";

pub struct ConnectivityConfig {
    pub beacon_port: u16,
    pub beacon_interval: Duration,
    /// Explicit local interfaces; probed from the host's address table when
    /// empty
    pub locals: Vec<Interface>,
}

pub struct ConnectivityManager {
    core: Arc<KernelCore>,
    config: ConnectivityConfig,
    blacklist: Blacklist,
    blacklist_event: PrivateEventId,
    cmd: Option<mpsc::UnboundedSender<DiscoveryCommand>>,
}

impl ConnectivityManager {
    pub fn new(core: Arc<KernelCore>, config: ConnectivityConfig) -> ConnectivityManager {
        let blacklist_event = core.new_private_event();
        ConnectivityManager {
            core,
            config,
            blacklist: Blacklist::default(),
            blacklist_event,
            cmd: None,
        }
    }

    fn send_cmd(&self, cmd: DiscoveryCommand) {
        if let Some(tx) = &self.cmd {
            if tx.send(cmd).is_err() {
                debug!("discovery task is gone");
            }
        }
    }

    fn apply_blacklist_object(&mut self, dobj: &DataObjectRef) {
        let doc = dobj.to_metadata();
        for entry in doc.children_named(BLACKLIST_TAG) {
            let kind = entry
                .parameter("type")
                .and_then(InterfaceKind::parse)
                .unwrap_or(InterfaceKind::Ethernet);
            let add = entry.parameter("action") != Some("remove");
            let Some(identifier) = entry.content().and_then(|s| parse_mac(s).ok()) else {
                warn!("ignoring blacklist entry without a valid identifier");
                continue;
            };

            if add {
                info!("blacklisting {} {:02x?}", kind, identifier);
                self.blacklist
                    .lock()
                    .insert((kind, identifier.to_vec()));
                // Tear down an already-tracked neighbor interface
                let key = haggle_core::InterfaceKey {
                    kind,
                    identifier: identifier.to_vec(),
                };
                if self.core.interface_store().contains(&key) {
                    self.send_cmd(DiscoveryCommand::Expire(key));
                }
            } else {
                info!("unblacklisting {} {:02x?}", kind, identifier);
                self.blacklist.lock().remove(&(kind, identifier.to_vec()));
            }
        }
    }
}

impl Manager for ConnectivityManager {
    fn name(&self) -> &'static str {
        "connectivity"
    }

    fn core(&self) -> &Arc<KernelCore> {
        &self.core
    }

    fn wants(&self, etype: &EventType) -> bool {
        match etype {
            EventType::ResourcePolicyNew => true,
            EventType::Private(id) => *id == self.blacklist_event,
            _ => false,
        }
    }

    fn on_prepare_startup(&mut self) {
        let locals = if self.config.locals.is_empty() {
            probe_local_interfaces()
        } else {
            std::mem::take(&mut self.config.locals)
        };

        let (tx, rx) = mpsc::unbounded_channel();
        Discovery::spawn(
            self.core.clone(),
            self.blacklist.clone(),
            self.config.beacon_interval,
            self.config.beacon_port,
            rx,
        );
        self.cmd = Some(tx);

        for mut iface in locals {
            iface.set_local(true);
            let (iface_ref, _) =
                self.core
                    .interface_store()
                    .add_or_update(iface, None, AgingPolicy::Ageless);
            info!(
                "local interface up: {} ({})",
                iface_ref.read().name(),
                iface_ref.read().key()
            );
            self.core.this_node().write().add_interface(iface_ref.clone());
            self.send_cmd(DiscoveryCommand::AddLocalInterface(iface_ref.clone()));
            self.core.post(Event::with_data(
                EventType::LocalInterfaceUp,
                EventData::Interface(iface_ref),
            ));
        }

        // Administrator pushes blacklist updates as data objects carrying
        // the Connectivity wildcard attribute
        let attrs: AttributeSet = [Attribute::new(CONNECTIVITY_ATTR, WILDCARD_VALUE)]
            .into_iter()
            .collect();
        self.core
            .datastore()
            .add_filter(Filter::new(attrs, self.blacklist_event), false);

        let core = self.core.clone();
        core.signal_ready_for_startup(self.name());
    }

    fn on_event(&mut self, event: &Event) {
        match &event.etype {
            EventType::ResourcePolicyNew => {
                if let EventData::Policy(policy) = &event.data {
                    self.send_cmd(DiscoveryCommand::SetBeaconInterval(policy.beacon_interval()));
                }
            }
            EventType::Private(id) if *id == self.blacklist_event => {
                if let EventData::DataObjects(list) = &event.data {
                    for dobj in list {
                        self.apply_blacklist_object(dobj);
                    }
                }
            }
            _ => {}
        }
    }

    fn on_prepare_shutdown(&mut self) {
        self.send_cmd(DiscoveryCommand::Shutdown);
        for iface in self.core.interface_store().local_interfaces() {
            let key = iface.read().key();
            self.core.interface_store().remove(&key);
            self.core.post(Event::with_data(
                EventType::LocalInterfaceDown,
                EventData::Interface(iface),
            ));
        }
        let core = self.core.clone();
        core.signal_ready_for_shutdown(self.name());
    }
}

/// Derive a stable locally-administered MAC-shaped identifier for a local
/// interface the platform driver gave us no hardware address for
pub fn derive_identifier(name: &str) -> [u8; 6] {
    let mut hasher = Sha1::new();
    hasher.update(b"haggle-local-iface");
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&digest[..6]);
    mac[0] = (mac[0] | 0x02) & 0xFE;
    mac
}

/// Enumerate usable local interfaces from the host's address table
pub fn probe_local_interfaces() -> Vec<Interface> {
    let mut out: Vec<Interface> = Vec::new();
    let addrs = match if_addrs::get_if_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("interface probe failed: {}", e);
            return out;
        }
    };
    for addr in addrs {
        if addr.is_loopback() {
            continue;
        }
        let IpAddr::V4(v4) = addr.addr.ip() else {
            continue;
        };
        if let Some(existing) = out.iter_mut().find(|i| i.name() == addr.name) {
            existing.add_address(Address::Ipv4(v4));
            continue;
        }
        let mac = derive_identifier(&addr.name);
        let mut iface = Interface::ethernet(mac, addr.name.clone());
        iface.add_address(Address::EthMac(mac));
        iface.add_address(Address::Ipv4(v4));
        out.push(iface);
    }
    info!("probed {} local interfaces", out.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_core::interface::format_mac;
    use haggle_core::{DataObject, Metadata};

    #[test]
    fn test_derived_identifier_is_stable_and_local() {
        let a = derive_identifier("eth0");
        let b = derive_identifier("eth0");
        let c = derive_identifier("wlan0");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a[0] & 0x02, 0x02);
        assert_eq!(a[0] & 0x01, 0x00);
    }

    #[test]
    fn test_blacklist_object_parsing() {
        let mac = [2u8, 1, 2, 3, 4, 5];
        let attrs: AttributeSet = [Attribute::new(CONNECTIVITY_ATTR, WILDCARD_VALUE)]
            .into_iter()
            .collect();
        let mut dobj = DataObject::from_attributes(attrs, false);
        let mut entry = Metadata::with_content(BLACKLIST_TAG, format_mac(&mac));
        entry.set_parameter("type", "ethernet");
        entry.set_parameter("action", "add");
        dobj.add_extension(entry);
        let dobj = dobj.into_ref();

        let core = KernelCore::new(
            haggle_core::Node::this_node("t", &[[2, 0, 0, 0, 0, 1]]).into_ref(),
            std::env::temp_dir(),
        );
        let mut manager = ConnectivityManager::new(
            core,
            ConnectivityConfig {
                beacon_port: 0,
                beacon_interval: Duration::from_secs(5),
                locals: vec![],
            },
        );
        manager.apply_blacklist_object(&dobj);
        assert!(manager
            .blacklist
            .lock()
            .contains(&(InterfaceKind::Ethernet, mac.to_vec())));

        // Remove entry lifts the ban
        let attrs: AttributeSet = [Attribute::new(CONNECTIVITY_ATTR, WILDCARD_VALUE)]
            .into_iter()
            .collect();
        let mut dobj = DataObject::from_attributes(attrs, false);
        let mut entry = Metadata::with_content(BLACKLIST_TAG, format_mac(&mac));
        entry.set_parameter("action", "remove");
        dobj.add_extension(entry);
        manager.apply_blacklist_object(&dobj.into_ref());
        assert!(manager.blacklist.lock().is_empty());
    }
}
