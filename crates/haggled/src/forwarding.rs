//! Forwarding manager
//!
//! The matching feedback loop of the steady state: fresh data objects are
//! node-queried for interested neighbors, fresh or updated neighbors are
//! data-object-queried for backlog, and successful sends feed the target's
//! advertised bloom filter so nothing is pushed twice.

use crate::event::{Event, EventData, EventType, PrivateEventId};
use crate::kernel::KernelCore;
use crate::manager::Manager;
use crate::matching::StoredNode;
use haggle_core::{NodeRef, NodeType};
use std::sync::Arc;
use tracing::{debug, info};

/// Cap on nodes returned per node query
const NODE_QUERY_MAX: usize = 10;
/// Minimum matched attributes for any query
const ATTR_MATCH_MIN: usize = 1;

pub struct ForwardingManager {
    core: Arc<KernelCore>,
    node_query_reply: PrivateEventId,
    object_query_reply: PrivateEventId,
}

impl ForwardingManager {
    pub fn new(core: Arc<KernelCore>) -> ForwardingManager {
        let node_query_reply = core.new_private_event();
        let object_query_reply = core.new_private_event();
        ForwardingManager {
            core,
            node_query_reply,
            object_query_reply,
        }
    }

    /// Map a data-store node row back to the live record, falling back to
    /// the row itself when the node is not currently tracked
    fn live_node(&self, node: &NodeRef) -> Option<NodeRef> {
        let id = *node.read().id();
        self.core.node_store().retrieve(&id)
    }
}

impl Manager for ForwardingManager {
    fn name(&self) -> &'static str {
        "forwarding"
    }

    fn core(&self) -> &Arc<KernelCore> {
        &self.core
    }

    fn wants(&self, etype: &EventType) -> bool {
        match etype {
            EventType::DataObjectNew
            | EventType::NodeContactNew
            | EventType::NodeUpdated
            | EventType::DataObjectSendSuccessful
            | EventType::DataObjectSendFailure => true,
            EventType::Private(id) => {
                *id == self.node_query_reply || *id == self.object_query_reply
            }
            _ => false,
        }
    }

    fn on_event(&mut self, event: &Event) {
        match &event.etype {
            EventType::DataObjectNew => {
                let Some(dobj) = event.data_object() else {
                    return;
                };
                self.core.datastore().node_query(
                    dobj.clone(),
                    NODE_QUERY_MAX,
                    ATTR_MATCH_MIN,
                    0,
                    self.node_query_reply,
                );
            }
            EventType::NodeContactNew | EventType::NodeUpdated => {
                let Some(node) = event.node() else {
                    return;
                };
                let snapshot = {
                    let n = node.read();
                    if n.node_type() == NodeType::Undefined {
                        // No interests known yet; wait for the description
                        return;
                    }
                    StoredNode::from_node(&n)
                };
                self.core.datastore().data_object_query(
                    snapshot,
                    ATTR_MATCH_MIN,
                    self.object_query_reply,
                );
            }
            EventType::Private(id) if *id == self.node_query_reply => {
                // Interested nodes for a fresh data object
                if let EventData::DataObjectAndNodes(dobj, nodes) = &event.data {
                    let targets: Vec<NodeRef> = nodes
                        .iter()
                        .filter_map(|n| self.live_node(n))
                        .filter(|n| n.read().is_neighbor())
                        .collect();
                    if targets.is_empty() {
                        return;
                    }
                    debug!("{} targets for {}", targets.len(), dobj);
                    self.core.post(Event::with_data(
                        EventType::TargetNodes,
                        EventData::DataObjectAndNodes(dobj.clone(), targets.clone()),
                    ));
                    self.core.post(Event::with_data(
                        EventType::DataObjectSend,
                        EventData::DataObjectAndNodes(dobj.clone(), targets),
                    ));
                }
            }
            EventType::Private(id) if *id == self.object_query_reply => {
                // Backlog candidates for a (re)appeared neighbor
                if let EventData::NodeAndDataObjects(node, dobjs) = &event.data {
                    let Some(live) = self.live_node(node) else {
                        return;
                    };
                    if !live.read().is_neighbor() {
                        return;
                    }
                    if !dobjs.is_empty() {
                        info!(
                            "pushing {} matching data objects to {}",
                            dobjs.len(),
                            live.read().name()
                        );
                    }
                    for dobj in dobjs {
                        self.core.post(Event::with_data(
                            EventType::DataObjectSend,
                            EventData::DataObjectAndNodes(dobj.clone(), vec![live.clone()]),
                        ));
                    }
                }
            }
            EventType::DataObjectSendSuccessful => {
                // The target provably has the object now; reflect that in
                // its bloom filter so repeated encounters converge
                let (Some(dobj), Some(target)) = (event.data_object(), event.node()) else {
                    return;
                };
                let snapshot = {
                    let mut node = target.write();
                    node.bloomfilter_add(dobj.id());
                    StoredNode::from_node(&node)
                };
                if snapshot.node_type != NodeType::Undefined {
                    self.core.datastore().insert_node(snapshot, true);
                }
            }
            EventType::DataObjectSendFailure => {
                if let (Some(dobj), Some(target)) = (event.data_object(), event.node()) {
                    debug!("send of {} to {} failed", dobj, target.read().name());
                }
            }
            _ => {}
        }
    }
}
