//! Nodes, their interests and their advertised bloom filters
//!
//! A node is identified by a 20-byte hash. The local node derives its id
//! from its MAC addresses; remote nodes carry theirs inside node
//! descriptions. A node is a neighbor when at least one of its interfaces
//! is currently up.

use crate::attribute::{Attribute, AttributeSet, WEIGHT_DEFAULT};
use crate::bloomfilter::Bloomfilter;
use crate::dataobject::{DataObject, DataObjectId};
use crate::error::{Error, Result};
use crate::interface::{Interface, InterfaceKey, InterfaceRef, MAC_LEN};
use crate::metadata::{Metadata, ATTRIBUTE_TAG};
use crate::time::Timestamp;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::sync::Arc;

pub const NODE_ID_LEN: usize = 20;

/// 20-byte node identifier
pub type NodeId = [u8; NODE_ID_LEN];

/// Node element tag inside a description document
pub const NODE_TAG: &str = "Node";
const BLOOMFILTER_TAG: &str = "Bloomfilter";
/// Attribute name marking a data object as a node description
pub const NODE_DESCRIPTION_ATTR: &str = "NodeDescription";

pub const MATCHING_THRESHOLD_DEFAULT: u32 = 0;
pub const MAX_DATAOBJECTS_PER_MATCH_DEFAULT: u32 = 10;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeType {
    ThisNode,
    Peer,
    Application,
    Gateway,
    Undefined,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::ThisNode => "this_node",
            NodeType::Peer => "peer",
            NodeType::Application => "application",
            NodeType::Gateway => "gateway",
            NodeType::Undefined => "undefined",
        }
    }

    pub fn parse(s: &str) -> Option<NodeType> {
        Some(match s {
            "this_node" => NodeType::ThisNode,
            "peer" => NodeType::Peer,
            "application" => NodeType::Application,
            "gateway" => NodeType::Gateway,
            "undefined" => NodeType::Undefined,
            _ => return None,
        })
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known node: the local one, a peer, or a registered application
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    node_type: NodeType,
    name: String,
    interests: AttributeSet,
    bloomfilter: Bloomfilter,
    matching_threshold: u32,
    max_dataobjects_per_match: u32,
    description_create_time: Option<Timestamp>,
    description_exchanged: bool,
    interfaces: Vec<InterfaceRef>,
}

/// Shared handle; the lock is the value lock of the locking discipline
pub type NodeRef = Arc<RwLock<Node>>;

impl Node {
    fn new(id: NodeId, node_type: NodeType, name: impl Into<String>) -> Node {
        Node {
            id,
            node_type,
            name: name.into(),
            interests: AttributeSet::new(),
            bloomfilter: Bloomfilter::plain(),
            matching_threshold: MATCHING_THRESHOLD_DEFAULT,
            max_dataobjects_per_match: MAX_DATAOBJECTS_PER_MATCH_DEFAULT,
            description_create_time: None,
            description_exchanged: false,
            interfaces: Vec::new(),
        }
    }

    /// The local node. The id is derived from the sorted set of local MAC
    /// identifiers so it is stable across restarts on the same hardware.
    pub fn this_node(name: impl Into<String>, macs: &[[u8; MAC_LEN]]) -> Node {
        let mut sorted: Vec<[u8; MAC_LEN]> = macs.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut hasher = Sha1::new();
        for mac in &sorted {
            hasher.update(mac);
        }
        let mut node = Node::new(hasher.finalize().into(), NodeType::ThisNode, name);
        node.bloomfilter = Bloomfilter::counting();
        node
    }

    /// Reconstruct a node from stored parts (datastore rows)
    pub fn with_id(id: NodeId, node_type: NodeType, name: impl Into<String>) -> Node {
        Node::new(id, node_type, name)
    }

    /// Placeholder for a neighbor whose description has not arrived yet
    pub fn undefined_from_interface(iface: &Interface) -> Node {
        let mut hasher = Sha1::new();
        hasher.update(b"undefined");
        hasher.update(iface.kind().as_str().as_bytes());
        hasher.update(iface.identifier());
        let mut node = Node::new(hasher.finalize().into(), NodeType::Undefined, "unknown");
        node.interfaces.push(iface.clone().into_ref());
        node
    }

    /// A registered application endpoint
    pub fn application(name: impl Into<String>) -> Node {
        let name = name.into();
        let mut hasher = Sha1::new();
        hasher.update(b"application");
        hasher.update(name.as_bytes());
        Node::new(hasher.finalize().into(), NodeType::Application, name)
    }

    /// Build a node from a received description data object
    pub fn from_description(dobj: &DataObject) -> Result<Node> {
        let m = dobj
            .extension(NODE_TAG)
            .ok_or_else(|| Error::Metadata("data object is not a node description".into()))?;
        let mut node = Node::from_metadata(m)?;
        node.description_create_time = dobj.create_time();
        Ok(node)
    }

    /// Parse the `Node` element of a description
    pub fn from_metadata(m: &Metadata) -> Result<Node> {
        if m.name() != NODE_TAG {
            return Err(Error::Metadata(format!("bad node element: {}", m.name())));
        }
        let node_type = m
            .parameter("type")
            .and_then(NodeType::parse)
            .unwrap_or(NodeType::Peer);
        let id_b64 = m
            .parameter("id")
            .ok_or_else(|| Error::Metadata("node without id".into()))?;
        let id_bytes = BASE64.decode(id_b64.trim())?;
        let id: NodeId = id_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Metadata("node id is not 20 bytes".into()))?;
        let name = m.parameter("name").unwrap_or("unknown").to_string();

        // A remote this_node is a peer from our point of view
        let node_type = match node_type {
            NodeType::ThisNode => NodeType::Peer,
            other => other,
        };
        let mut node = Node::new(id, node_type, name);

        if let Some(t) = m.parameter("matching_threshold") {
            node.matching_threshold = t
                .parse()
                .map_err(|_| Error::Metadata(format!("bad matching_threshold: {t}")))?;
        }
        if let Some(n) = m.parameter("max_dataobjects") {
            node.max_dataobjects_per_match = n
                .parse()
                .map_err(|_| Error::Metadata(format!("bad max_dataobjects: {n}")))?;
        }

        for im in m.children_named(crate::interface::INTERFACE_TAG) {
            node.interfaces.push(Interface::from_metadata(im)?.into_ref());
        }
        for am in m.children_named(ATTRIBUTE_TAG) {
            let name = am
                .parameter("name")
                .ok_or_else(|| Error::Metadata("interest without name".into()))?;
            let value = am.content().unwrap_or_default();
            let weight = match am.parameter("weight") {
                Some(w) => w
                    .parse()
                    .map_err(|_| Error::Metadata(format!("bad weight: {w}")))?,
                None => WEIGHT_DEFAULT,
            };
            node.interests.add(Attribute::with_weight(name, value, weight));
        }
        if let Some(bm) = m.child(BLOOMFILTER_TAG) {
            if let Some(content) = bm.content() {
                node.bloomfilter = Bloomfilter::from_base64(content)?;
            }
        }
        Ok(node)
    }

    /// The `Node` element of this node's description
    pub fn to_metadata(&self) -> Metadata {
        let mut m = Metadata::new(NODE_TAG);
        // Advertise ourselves as a peer; this_node is a local distinction
        let advertised = match self.node_type {
            NodeType::ThisNode => NodeType::Peer,
            other => other,
        };
        m.set_parameter("type", advertised.as_str());
        m.set_parameter("id", BASE64.encode(self.id));
        m.set_parameter("name", &self.name);
        m.set_parameter("matching_threshold", self.matching_threshold);
        m.set_parameter("max_dataobjects", self.max_dataobjects_per_match);

        for iface in &self.interfaces {
            m.add_child(iface.read().to_metadata());
        }
        for attr in &self.interests {
            let mut elem = Metadata::with_content(ATTRIBUTE_TAG, attr.value());
            elem.set_parameter("name", attr.name());
            if attr.weight() != WEIGHT_DEFAULT {
                elem.set_parameter("weight", attr.weight());
            }
            m.add_child(elem);
        }
        m.add_child(Metadata::with_content(
            BLOOMFILTER_TAG,
            self.bloomfilter.to_plain().to_base64(),
        ));
        m
    }

    /// Wrap the description in a data object ready for dissemination.
    /// The interests ride along as data-object attributes, so a description
    /// is matchable like any other object (queries exclude a node's own)
    /// and gets a fresh id whenever the interest set changes.
    pub fn description_data_object(&self) -> DataObject {
        let mut attrs = self.interests.clone();
        attrs.add(Attribute::new(NODE_DESCRIPTION_ATTR, self.id_base64()));
        let mut dobj = DataObject::from_attributes(attrs, true);
        dobj.add_extension(self.to_metadata());
        dobj
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn id_str(&self) -> String {
        hex::encode(self.id)
    }

    pub fn id_base64(&self) -> String {
        BASE64.encode(self.id)
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn interests(&self) -> &AttributeSet {
        &self.interests
    }

    pub fn add_interest(&mut self, attr: Attribute) -> bool {
        self.interests.add(attr)
    }

    pub fn remove_interest(&mut self, name: &str, value: &str) -> Option<Attribute> {
        self.interests.remove(name, value)
    }

    pub fn set_interests(&mut self, interests: AttributeSet) {
        self.interests = interests;
    }

    pub fn bloomfilter(&self) -> &Bloomfilter {
        &self.bloomfilter
    }

    pub fn bloomfilter_mut(&mut self) -> &mut Bloomfilter {
        &mut self.bloomfilter
    }

    pub fn set_bloomfilter(&mut self, bloomfilter: Bloomfilter) {
        self.bloomfilter = bloomfilter;
    }

    /// Record that the node has this data object
    pub fn bloomfilter_add(&mut self, id: &DataObjectId) {
        self.bloomfilter.add(id);
    }

    pub fn has_data_object(&self, id: &DataObjectId) -> bool {
        self.bloomfilter.contains(id)
    }

    pub fn matching_threshold(&self) -> u32 {
        self.matching_threshold
    }

    pub fn set_matching_threshold(&mut self, t: u32) {
        self.matching_threshold = t;
    }

    pub fn max_dataobjects_per_match(&self) -> u32 {
        self.max_dataobjects_per_match
    }

    pub fn set_max_dataobjects_per_match(&mut self, n: u32) {
        self.max_dataobjects_per_match = n;
    }

    pub fn description_create_time(&self) -> Option<Timestamp> {
        self.description_create_time
    }

    pub fn set_description_create_time(&mut self, ts: Option<Timestamp>) {
        self.description_create_time = ts;
    }

    pub fn description_exchanged(&self) -> bool {
        self.description_exchanged
    }

    pub fn set_description_exchanged(&mut self, exchanged: bool) {
        self.description_exchanged = exchanged;
    }

    pub fn interfaces(&self) -> &[InterfaceRef] {
        &self.interfaces
    }

    /// Attach an interface, replacing any existing record with the same key
    pub fn add_interface(&mut self, iface: InterfaceRef) {
        let key = iface.read().key();
        self.interfaces.retain(|i| i.read().key() != key);
        self.interfaces.push(iface);
    }

    pub fn remove_interface(&mut self, key: &InterfaceKey) -> bool {
        let before = self.interfaces.len();
        self.interfaces.retain(|i| i.read().key() != *key);
        before != self.interfaces.len()
    }

    pub fn interface(&self, key: &InterfaceKey) -> Option<&InterfaceRef> {
        self.interfaces.iter().find(|i| i.read().key() == *key)
    }

    pub fn has_interface(&self, key: &InterfaceKey) -> bool {
        self.interface(key).is_some()
    }

    /// A node is a neighbor iff at least one of its interfaces is up
    pub fn is_neighbor(&self) -> bool {
        self.interfaces.iter().any(|i| i.read().is_up())
    }

    pub fn into_ref(self) -> NodeRef {
        Arc::new(RwLock::new(self))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, &self.id_str()[..8])
    }
}
