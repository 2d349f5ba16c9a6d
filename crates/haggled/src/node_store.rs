//! Reference-counted store of known nodes
//!
//! Exactly one record exists per node id. Undefined placeholder nodes are
//! created when a neighbor interface appears before its node description;
//! they are merged into the defined node the moment any of their interfaces
//! is found on the defined node's interface list.

use haggle_core::{InterfaceKey, Node, NodeId, NodeRef, NodeType};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Outcome of reconciling an incoming node with the store
pub struct NodeUpdate {
    /// The live record for the node (existing ref when the id was known)
    pub node: NodeRef,
    /// Undefined placeholders that were absorbed
    pub merged: Vec<NodeRef>,
    /// Whether a record with this id already existed
    pub was_known: bool,
}

/// In-memory index of known nodes
#[derive(Default)]
pub struct NodeStore {
    inner: Mutex<HashMap<NodeId, NodeRef>>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node: NodeRef) {
        let id = *node.read().id();
        self.inner.lock().insert(id, node);
    }

    pub fn retrieve(&self, id: &NodeId) -> Option<NodeRef> {
        self.inner.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.inner.lock().contains_key(id)
    }

    /// The node owning an interface with the given key, if any
    pub fn retrieve_by_interface(&self, key: &InterfaceKey) -> Option<NodeRef> {
        self.inner
            .lock()
            .values()
            .find(|n| n.read().has_interface(key))
            .cloned()
    }

    pub fn retrieve_by_type(&self, node_type: NodeType) -> Vec<NodeRef> {
        self.inner
            .lock()
            .values()
            .filter(|n| n.read().node_type() == node_type)
            .cloned()
            .collect()
    }

    pub fn retrieve_by_name(&self, name: &str) -> Option<NodeRef> {
        self.inner
            .lock()
            .values()
            .find(|n| n.read().name() == name)
            .cloned()
    }

    /// Nodes with at least one interface currently up
    pub fn neighbors(&self) -> Vec<NodeRef> {
        self.inner
            .lock()
            .values()
            .filter(|n| n.read().is_neighbor())
            .cloned()
            .collect()
    }

    pub fn remove(&self, id: &NodeId) -> Option<NodeRef> {
        self.inner.lock().remove(id)
    }

    /// Remove the node owning an interface with the given key
    pub fn remove_by_interface(&self, key: &InterfaceKey) -> Option<NodeRef> {
        let mut inner = self.inner.lock();
        let id = inner
            .iter()
            .find(|(_, n)| n.read().has_interface(key))
            .map(|(id, _)| *id)?;
        inner.remove(&id)
    }

    /// Remove every node of the given type, returning them
    pub fn remove_by_type(&self, node_type: NodeType) -> Vec<NodeRef> {
        let mut inner = self.inner.lock();
        let ids: Vec<NodeId> = inner
            .iter()
            .filter(|(_, n)| n.read().node_type() == node_type)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| inner.remove(&id)).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Reconcile an incoming defined node with the store.
    ///
    /// Undefined nodes whose interface sets overlap the incoming one are
    /// removed; their live interface records (carrying UP flags) replace the
    /// incoming node's parsed copies, and the incoming node inherits the
    /// exchanged-description state from whichever old record had it set. An
    /// existing record with the same id is replaced in place so that held
    /// refs observe the update.
    pub fn update(&self, mut incoming: Node) -> NodeUpdate {
        let mut inner = self.inner.lock();

        let incoming_keys: Vec<InterfaceKey> = incoming
            .interfaces()
            .iter()
            .map(|i| i.read().key())
            .collect();

        let placeholder_ids: Vec<NodeId> = inner
            .iter()
            .filter(|(id, n)| {
                **id != *incoming.id() && {
                    let n = n.read();
                    n.node_type() == NodeType::Undefined
                        && n.interfaces()
                            .iter()
                            .any(|i| incoming_keys.contains(&i.read().key()))
                }
            })
            .map(|(id, _)| *id)
            .collect();

        let mut merged = Vec::with_capacity(placeholder_ids.len());
        let mut exchanged = incoming.description_exchanged();
        for id in placeholder_ids {
            if let Some(old) = inner.remove(&id) {
                {
                    let old_node = old.read();
                    exchanged |= old_node.description_exchanged();
                    for iface in old_node.interfaces() {
                        if incoming_keys.contains(&iface.read().key()) {
                            // Swap in the live record so UP state carries over
                            incoming.add_interface(iface.clone());
                        }
                    }
                }
                merged.push(old);
            }
        }
        incoming.set_description_exchanged(exchanged);

        let existing = inner.get(incoming.id()).cloned();
        match existing {
            Some(node) => {
                {
                    let mut guard = node.write();
                    if guard.description_exchanged() {
                        incoming.set_description_exchanged(true);
                    }
                    for iface in guard.interfaces() {
                        if incoming_keys.contains(&iface.read().key()) {
                            incoming.add_interface(iface.clone());
                        }
                    }
                    *guard = incoming;
                }
                NodeUpdate {
                    node,
                    merged,
                    was_known: true,
                }
            }
            None => {
                let node = incoming.into_ref();
                let id = *node.read().id();
                inner.insert(id, node.clone());
                NodeUpdate {
                    node,
                    merged,
                    was_known: false,
                }
            }
        }
    }
}
