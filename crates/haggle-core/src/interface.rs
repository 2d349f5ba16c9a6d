//! Network interfaces and their addresses
//!
//! An interface is keyed by `(kind, identifier bytes)`; the identifier length
//! is kind-determined (6-byte MAC, 2-byte port, path string). Interfaces are
//! handed around as reference-counted values with their own lock, so holders
//! never need the containing store's lock.

use crate::error::{Error, Result};
use crate::metadata::Metadata;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;

pub const MAC_LEN: usize = 6;

/// Interface element tag in node descriptions
pub const INTERFACE_TAG: &str = "Interface";

/// Link-layer family of an interface
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InterfaceKind {
    Ethernet,
    Wifi,
    Bluetooth,
    Media,
    ApplicationPort,
    ApplicationLocal,
    Undefined,
}

impl InterfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceKind::Ethernet => "ethernet",
            InterfaceKind::Wifi => "wifi",
            InterfaceKind::Bluetooth => "bluetooth",
            InterfaceKind::Media => "media",
            InterfaceKind::ApplicationPort => "application_port",
            InterfaceKind::ApplicationLocal => "application_local",
            InterfaceKind::Undefined => "undefined",
        }
    }

    pub fn parse(s: &str) -> Option<InterfaceKind> {
        Some(match s {
            "ethernet" => InterfaceKind::Ethernet,
            "wifi" => InterfaceKind::Wifi,
            "bluetooth" => InterfaceKind::Bluetooth,
            "media" => InterfaceKind::Media,
            "application_port" => InterfaceKind::ApplicationPort,
            "application_local" => InterfaceKind::ApplicationLocal,
            "undefined" => InterfaceKind::Undefined,
            _ => return None,
        })
    }

    /// Expected identifier length in bytes, when fixed for the kind
    pub fn identifier_len(&self) -> Option<usize> {
        match self {
            InterfaceKind::Ethernet | InterfaceKind::Wifi | InterfaceKind::Bluetooth => {
                Some(MAC_LEN)
            }
            InterfaceKind::ApplicationPort => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reachable address of an interface
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    EthMac([u8; MAC_LEN]),
    BtMac([u8; MAC_LEN]),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    /// Transport port complementing an IP address on the same interface
    Port(u16),
    FilePath(PathBuf),
    LocalPath(PathBuf),
}

impl Address {
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(a) => Some(IpAddr::V4(*a)),
            Address::Ipv6(a) => Some(IpAddr::V6(*a)),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::EthMac(mac) | Address::BtMac(mac) => write!(f, "{}", format_mac(mac)),
            Address::Ipv4(a) => write!(f, "{a}"),
            Address::Ipv6(a) => write!(f, "{a}"),
            Address::Port(p) => write!(f, "port/{p}"),
            Address::FilePath(p) => write!(f, "file://{}", p.display()),
            Address::LocalPath(p) => write!(f, "local://{}", p.display()),
        }
    }
}

pub fn format_mac(mac: &[u8; MAC_LEN]) -> String {
    mac.iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_mac(s: &str) -> Result<[u8; MAC_LEN]> {
    let digits: String = s.split(':').collect();
    let bytes =
        hex::decode(&digits).map_err(|_| Error::InvalidIdentifier(format!("bad mac: {s}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidIdentifier(format!("bad mac: {s}")))
}

/// The `(kind, identifier)` pair that uniquely names an interface
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InterfaceKey {
    pub kind: InterfaceKind,
    pub identifier: Vec<u8>,
}

impl fmt::Display for InterfaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, hex::encode(&self.identifier))
    }
}

/// A network interface record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interface {
    kind: InterfaceKind,
    identifier: Vec<u8>,
    name: String,
    addresses: Vec<Address>,
    up: bool,
    local: bool,
    snooped: bool,
    stored: bool,
}

/// Shared handle; the lock is the value lock of the locking discipline
pub type InterfaceRef = Arc<RwLock<Interface>>;

impl Interface {
    pub fn new(kind: InterfaceKind, identifier: Vec<u8>, name: impl Into<String>) -> Result<Self> {
        if let Some(expected) = kind.identifier_len() {
            if identifier.len() != expected {
                return Err(Error::InvalidIdentifier(format!(
                    "{kind} identifier must be {expected} bytes, got {}",
                    identifier.len()
                )));
            }
        }
        Ok(Interface {
            kind,
            identifier,
            name: name.into(),
            addresses: Vec::new(),
            up: false,
            local: false,
            snooped: false,
            stored: false,
        })
    }

    pub fn ethernet(mac: [u8; MAC_LEN], name: impl Into<String>) -> Self {
        Interface::new(InterfaceKind::Ethernet, mac.to_vec(), name)
            .expect("mac identifier is always valid")
    }

    pub fn wifi(mac: [u8; MAC_LEN], name: impl Into<String>) -> Self {
        Interface::new(InterfaceKind::Wifi, mac.to_vec(), name)
            .expect("mac identifier is always valid")
    }

    pub fn application_port(port: u16) -> Self {
        let mut iface = Interface::new(
            InterfaceKind::ApplicationPort,
            port.to_be_bytes().to_vec(),
            format!("application:{port}"),
        )
        .expect("port identifier is always valid");
        iface.addresses.push(Address::Ipv4(Ipv4Addr::LOCALHOST));
        iface.addresses.push(Address::Port(port));
        iface
    }

    pub fn into_ref(self) -> InterfaceRef {
        Arc::new(RwLock::new(self))
    }

    pub fn kind(&self) -> InterfaceKind {
        self.kind
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    pub fn key(&self) -> InterfaceKey {
        InterfaceKey {
            kind: self.kind,
            identifier: self.identifier.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// MAC identifier for link-layer kinds
    pub fn mac(&self) -> Option<[u8; MAC_LEN]> {
        match self.kind {
            InterfaceKind::Ethernet | InterfaceKind::Wifi | InterfaceKind::Bluetooth => {
                self.identifier.as_slice().try_into().ok()
            }
            _ => None,
        }
    }

    /// Application port for `application_port` interfaces
    pub fn application_port_number(&self) -> Option<u16> {
        if self.kind == InterfaceKind::ApplicationPort {
            self.identifier
                .as_slice()
                .try_into()
                .ok()
                .map(u16::from_be_bytes)
        } else {
            None
        }
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn add_address(&mut self, addr: Address) {
        if !self.addresses.contains(&addr) {
            self.addresses.push(addr);
        }
    }

    pub fn set_addresses(&mut self, addrs: Vec<Address>) {
        self.addresses = addrs;
    }

    pub fn first_ip(&self) -> Option<IpAddr> {
        self.addresses.iter().find_map(|a| a.ip())
    }

    pub fn port(&self) -> Option<u16> {
        self.addresses.iter().find_map(|a| match a {
            Address::Port(p) => Some(*p),
            _ => None,
        })
    }

    pub fn is_up(&self) -> bool {
        self.up
    }

    pub fn set_up(&mut self, up: bool) {
        self.up = up;
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn set_local(&mut self, local: bool) {
        self.local = local;
    }

    pub fn is_snooped(&self) -> bool {
        self.snooped
    }

    pub fn set_snooped(&mut self, snooped: bool) {
        self.snooped = snooped;
    }

    pub fn is_stored(&self) -> bool {
        self.stored
    }

    pub fn set_stored(&mut self, stored: bool) {
        self.stored = stored;
    }

    /// Interface element for a node description
    pub fn to_metadata(&self) -> Metadata {
        let mut m = Metadata::new(INTERFACE_TAG);
        m.set_parameter("type", self.kind.as_str());
        m.set_parameter("identifier", hex::encode(&self.identifier));
        for addr in &self.addresses {
            m.add_child(Metadata::with_content("Address", addr.to_string()));
        }
        m
    }

    /// Parse an interface element from a node description
    pub fn from_metadata(m: &Metadata) -> Result<Interface> {
        let kind_str = m
            .parameter("type")
            .ok_or_else(|| Error::Metadata("interface without type".into()))?;
        let kind = InterfaceKind::parse(kind_str)
            .ok_or_else(|| Error::Metadata(format!("unknown interface type {kind_str}")))?;
        let ident_hex = m
            .parameter("identifier")
            .ok_or_else(|| Error::Metadata("interface without identifier".into()))?;
        let identifier = hex::decode(ident_hex)
            .map_err(|_| Error::InvalidIdentifier(format!("bad hex: {ident_hex}")))?;
        let mut iface = Interface::new(kind, identifier, kind_str)?;
        for addr in m.children_named("Address") {
            if let Some(text) = addr.content() {
                if let Some(parsed) = parse_address(text) {
                    iface.add_address(parsed);
                }
            }
        }
        Ok(iface)
    }
}

fn parse_address(s: &str) -> Option<Address> {
    if let Some(path) = s.strip_prefix("file://") {
        return Some(Address::FilePath(PathBuf::from(path)));
    }
    if let Some(path) = s.strip_prefix("local://") {
        return Some(Address::LocalPath(PathBuf::from(path)));
    }
    if let Some(port) = s.strip_prefix("port/") {
        return port.parse().ok().map(Address::Port);
    }
    if let Ok(v4) = s.parse::<Ipv4Addr>() {
        return Some(Address::Ipv4(v4));
    }
    if let Ok(v6) = s.parse::<Ipv6Addr>() {
        return Some(Address::Ipv6(v6));
    }
    parse_mac(s).ok().map(Address::EthMac)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; MAC_LEN] = [0x02, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e];

    #[test]
    fn test_identifier_length_checked() {
        assert!(Interface::new(InterfaceKind::Ethernet, vec![1, 2, 3], "eth0").is_err());
        assert!(Interface::new(InterfaceKind::Ethernet, MAC.to_vec(), "eth0").is_ok());
    }

    #[test]
    fn test_key_identity() {
        let a = Interface::ethernet(MAC, "eth0");
        let mut b = Interface::ethernet(MAC, "something-else");
        b.add_address(Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_mac_formatting() {
        assert_eq!(format_mac(&MAC), "02:1a:2b:3c:4d:5e");
        assert_eq!(parse_mac("02:1a:2b:3c:4d:5e").unwrap(), MAC);
        assert!(parse_mac("02:1a:2b").is_err());
    }

    #[test]
    fn test_application_port_interface() {
        let iface = Interface::application_port(4711);
        assert_eq!(iface.application_port_number(), Some(4711));
        assert_eq!(iface.port(), Some(4711));
        assert!(iface.first_ip().unwrap().is_loopback());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut iface = Interface::ethernet(MAC, "eth0");
        iface.add_address(Address::EthMac(MAC));
        iface.add_address(Address::Ipv4(Ipv4Addr::new(192, 168, 1, 17)));

        let parsed = Interface::from_metadata(&iface.to_metadata()).unwrap();
        assert_eq!(parsed.key(), iface.key());
        assert_eq!(parsed.addresses(), iface.addresses());
    }
}
