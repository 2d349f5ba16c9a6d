//! Node manager
//!
//! Tracks neighbor contacts and runs the node-description exchange: a new
//! neighbor interface yields an undefined placeholder node and a send of our
//! own description; a received description defines the node, merges
//! placeholders and lands in the data store.

use crate::event::{Event, EventData, EventType};
use crate::kernel::KernelCore;
use crate::manager::Manager;
use crate::matching::{description_node_id, StoredNode};
use haggle_core::{Node, NodeType};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct NodeManager {
    core: Arc<KernelCore>,
}

impl NodeManager {
    pub fn new(core: Arc<KernelCore>) -> NodeManager {
        NodeManager { core }
    }

    fn send_our_description(&self, target: haggle_core::NodeRef) {
        if target.read().description_exchanged() {
            return;
        }
        let desc = self
            .core
            .this_node()
            .read()
            .description_data_object()
            .into_ref();
        debug!(
            "sending node description to {}",
            target.read().name()
        );
        self.core.post(Event::with_data(
            EventType::NodeDescriptionSend,
            EventData::Node(target.clone()),
        ));
        self.core.post(Event::with_data(
            EventType::DataObjectSend,
            EventData::DataObjectAndNodes(desc, vec![target]),
        ));
    }
}

impl Manager for NodeManager {
    fn name(&self) -> &'static str {
        "node"
    }

    fn core(&self) -> &Arc<KernelCore> {
        &self.core
    }

    fn wants(&self, etype: &EventType) -> bool {
        matches!(
            etype,
            EventType::NeighborInterfaceUp
                | EventType::NeighborInterfaceDown
                | EventType::DataObjectReceived
                | EventType::DataObjectSendSuccessful
        )
    }

    fn on_event(&mut self, event: &Event) {
        match &event.etype {
            EventType::NeighborInterfaceUp => {
                let Some(iface) = event.interface() else {
                    return;
                };
                let key = iface.read().key();
                match self.core.node_store().retrieve_by_interface(&key) {
                    Some(node) => {
                        info!("node contact: {}", node.read().name());
                        self.core.post(Event::with_data(
                            EventType::NodeContactNew,
                            EventData::Node(node.clone()),
                        ));
                        self.send_our_description(node);
                    }
                    None => {
                        // First sign of this neighbor: undefined placeholder
                        // holding the live interface record
                        let mut placeholder = Node::undefined_from_interface(&iface.read());
                        placeholder.add_interface(iface.clone());
                        let node = placeholder.into_ref();
                        self.core.node_store().add(node.clone());
                        info!("new undefined neighbor via {}", key);
                        self.core.post(Event::with_data(
                            EventType::NodeContactNew,
                            EventData::Node(node.clone()),
                        ));
                        self.send_our_description(node);
                    }
                }
            }
            EventType::NeighborInterfaceDown => {
                let Some(iface) = event.interface() else {
                    return;
                };
                let key = iface.read().key();
                let Some(node) = self.core.node_store().retrieve_by_interface(&key) else {
                    return;
                };
                let (gone, undefined) = {
                    let n = node.read();
                    (!n.is_neighbor(), n.node_type() == NodeType::Undefined)
                };
                if gone {
                    info!("node contact ended: {}", node.read().name());
                    if undefined {
                        self.core.node_store().remove_by_interface(&key);
                    }
                    self.core.post(Event::with_data(
                        EventType::NodeContactEnd,
                        EventData::Node(node),
                    ));
                }
            }
            EventType::DataObjectReceived => {
                let Some(dobj) = event.data_object() else {
                    return;
                };
                if !dobj.is_node_description() {
                    return;
                }
                let node = match Node::from_description(dobj) {
                    Ok(node) => node,
                    Err(e) => {
                        warn!("undecodable node description {}: {}", dobj, e);
                        return;
                    }
                };
                if node.id() == self.core.this_node().read().id() {
                    debug!("ignoring our own node description");
                    return;
                }

                info!("node description from {}", node.name());
                let update = self.core.node_store().update(node);
                self.core
                    .datastore()
                    .insert_node(StoredNode::from_node(&update.node.read()), true);

                let etype = if update.was_known {
                    EventType::NodeUpdated
                } else {
                    EventType::NodeContactNew
                };
                self.core.post(Event::with_data(
                    etype,
                    EventData::Node(update.node.clone()),
                ));
                self.send_our_description(update.node);
            }
            EventType::DataObjectSendSuccessful => {
                // Mark the exchange done when our own description got through
                let (Some(dobj), Some(target)) = (event.data_object(), event.node()) else {
                    return;
                };
                if !dobj.is_node_description() {
                    return;
                }
                let ours = description_node_id(dobj)
                    .map(|id| id == *self.core.this_node().read().id())
                    .unwrap_or(false);
                if ours {
                    target.write().set_description_exchanged(true);
                }
            }
            _ => {}
        }
    }
}
