//! The data store actor
//!
//! All data-store operations are submitted from any thread as tasks on a
//! channel and executed by a single dedicated thread, which both serializes
//! index access and keeps query latency off the kernel thread. Completions
//! and results flow back to callers as events on the kernel queue.
//!
//! Persistence lives in a sled database (`haggle.db`); the in-memory
//! matching indexes are rebuilt from it at startup.

use crate::event::{Event, EventData, EventQueue, EventType, PrivateEventId};
use crate::matching::{Filter, InsertOutcome, MatchingIndex, StoredNode};
use haggle_core::{
    DataObject, DataObjectId, DataObjectRef, NodeId, NodeType, RepositoryEntry, Timestamp,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default replay bound for filters registered with `match_now`
pub const FILTER_REPLAY_CAP: usize = 10;

/// Batch cap for one aging sweep
pub const AGE_BATCH_CAP: usize = 100;

/// Data store errors
#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tasks consumed by the data store thread
pub enum DataStoreTask {
    InsertDataObject {
        dobj: DataObjectRef,
        reply: Option<PrivateEventId>,
    },
    DeleteDataObject {
        id: DataObjectId,
        report: bool,
    },
    AgeDataObjects {
        min_age: Duration,
        reply: Option<PrivateEventId>,
    },
    InsertNode {
        node: StoredNode,
        merge_bloomfilter: bool,
    },
    RetrieveNode {
        id: NodeId,
        reply: PrivateEventId,
        force_reply: bool,
    },
    RetrieveNodesByType {
        node_type: NodeType,
        reply: PrivateEventId,
    },
    AddFilter {
        filter: Filter,
        match_now: bool,
    },
    RemoveFilter {
        event: PrivateEventId,
    },
    FilterQuery {
        filter: Filter,
        reply: PrivateEventId,
    },
    DataObjectQuery {
        node: StoredNode,
        attr_match_min: usize,
        reply: PrivateEventId,
    },
    DataObjectsForNodesQuery {
        node: StoredNode,
        delegates: Vec<StoredNode>,
        attr_match_min: usize,
        reply: PrivateEventId,
    },
    NodeQuery {
        dobj: DataObjectRef,
        max_resp: usize,
        attr_match_min: usize,
        ratio_floor: u32,
        reply: PrivateEventId,
    },
    InsertRepository(RepositoryEntry),
    ReadRepository {
        authority: String,
        key: Option<String>,
        reply: PrivateEventId,
    },
    DeleteRepository {
        authority: String,
        key: String,
    },
    Shutdown,
}

/// Thread-safe handle; all calls are non-blocking enqueues
#[derive(Clone)]
pub struct DataStoreHandle {
    tx: mpsc::UnboundedSender<DataStoreTask>,
}

impl DataStoreHandle {
    fn submit(&self, task: DataStoreTask) {
        if self.tx.send(task).is_err() {
            debug!("data store is gone; task dropped");
        }
    }

    pub fn insert_data_object(&self, dobj: DataObjectRef, reply: Option<PrivateEventId>) {
        self.submit(DataStoreTask::InsertDataObject { dobj, reply });
    }

    pub fn delete_data_object(&self, id: DataObjectId, report: bool) {
        self.submit(DataStoreTask::DeleteDataObject { id, report });
    }

    pub fn age_data_objects(&self, min_age: Duration, reply: Option<PrivateEventId>) {
        self.submit(DataStoreTask::AgeDataObjects { min_age, reply });
    }

    pub fn insert_node(&self, node: StoredNode, merge_bloomfilter: bool) {
        self.submit(DataStoreTask::InsertNode {
            node,
            merge_bloomfilter,
        });
    }

    pub fn retrieve_node(&self, id: NodeId, reply: PrivateEventId, force_reply: bool) {
        self.submit(DataStoreTask::RetrieveNode {
            id,
            reply,
            force_reply,
        });
    }

    pub fn retrieve_nodes_by_type(&self, node_type: NodeType, reply: PrivateEventId) {
        self.submit(DataStoreTask::RetrieveNodesByType { node_type, reply });
    }

    pub fn add_filter(&self, filter: Filter, match_now: bool) {
        self.submit(DataStoreTask::AddFilter { filter, match_now });
    }

    pub fn remove_filter(&self, event: PrivateEventId) {
        self.submit(DataStoreTask::RemoveFilter { event });
    }

    pub fn filter_query(&self, filter: Filter, reply: PrivateEventId) {
        self.submit(DataStoreTask::FilterQuery { filter, reply });
    }

    pub fn data_object_query(&self, node: StoredNode, attr_match_min: usize, reply: PrivateEventId) {
        self.submit(DataStoreTask::DataObjectQuery {
            node,
            attr_match_min,
            reply,
        });
    }

    pub fn data_objects_for_nodes_query(
        &self,
        node: StoredNode,
        delegates: Vec<StoredNode>,
        attr_match_min: usize,
        reply: PrivateEventId,
    ) {
        self.submit(DataStoreTask::DataObjectsForNodesQuery {
            node,
            delegates,
            attr_match_min,
            reply,
        });
    }

    pub fn node_query(
        &self,
        dobj: DataObjectRef,
        max_resp: usize,
        attr_match_min: usize,
        ratio_floor: u32,
        reply: PrivateEventId,
    ) {
        self.submit(DataStoreTask::NodeQuery {
            dobj,
            max_resp,
            attr_match_min,
            ratio_floor,
            reply,
        });
    }

    pub fn insert_repository(&self, entry: RepositoryEntry) {
        self.submit(DataStoreTask::InsertRepository(entry));
    }

    pub fn read_repository(&self, authority: impl Into<String>, key: Option<String>, reply: PrivateEventId) {
        self.submit(DataStoreTask::ReadRepository {
            authority: authority.into(),
            key,
            reply,
        });
    }

    pub fn delete_repository(&self, authority: impl Into<String>, key: impl Into<String>) {
        self.submit(DataStoreTask::DeleteRepository {
            authority: authority.into(),
            key: key.into(),
        });
    }

    pub fn shutdown(&self) {
        self.submit(DataStoreTask::Shutdown);
    }
}

struct DataStore {
    index: MatchingIndex,
    db: sled::Db,
    objects: sled::Tree,
    nodes: sled::Tree,
    repository: sled::Tree,
    queue: Arc<EventQueue>,
}

/// Open the database, rebuild the indexes and start the data store thread
pub fn spawn(db_path: &Path, queue: Arc<EventQueue>) -> Result<DataStoreHandle, DataStoreError> {
    let db = sled::open(db_path)?;
    let objects = db.open_tree("dataobjects")?;
    let nodes = db.open_tree("nodes")?;
    let repository = db.open_tree("repository")?;

    let mut store = DataStore {
        index: MatchingIndex::new(),
        db,
        objects,
        nodes,
        repository,
        queue,
    };
    store.load()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("haggle-datastore".into())
        .spawn(move || {
            while let Some(task) = rx.blocking_recv() {
                if matches!(task, DataStoreTask::Shutdown) {
                    break;
                }
                store.handle(task);
            }
            if let Err(e) = store.db.flush() {
                warn!("data store flush on shutdown failed: {}", e);
            }
            debug!("data store thread exiting");
        })?;

    Ok(DataStoreHandle { tx })
}

impl DataStore {
    fn load(&mut self) -> Result<(), DataStoreError> {
        let mut object_count = 0usize;
        for row in self.objects.iter() {
            let (_, bytes) = row?;
            match postcard::from_bytes::<DataObject>(&bytes) {
                Ok(dobj) => {
                    dobj.set_stored(true);
                    self.index.insert_object(&dobj.into_ref());
                    object_count += 1;
                }
                Err(e) => warn!("skipping undecodable data object row: {}", e),
            }
        }
        let mut node_count = 0usize;
        for row in self.nodes.iter() {
            let (_, bytes) = row?;
            match postcard::from_bytes::<StoredNode>(&bytes) {
                Ok(node) => {
                    self.index.insert_node(node, false);
                    node_count += 1;
                }
                Err(e) => warn!("skipping undecodable node row: {}", e),
            }
        }
        info!(
            "data store loaded: {} data objects, {} nodes",
            object_count, node_count
        );
        Ok(())
    }

    fn post(&self, event: Event) {
        self.queue.push(event);
    }

    fn fire_filters(&self, dobj: &DataObjectRef) {
        for event in self.index.matching_filters(dobj) {
            self.post(Event::with_data(
                EventType::Private(event),
                EventData::DataObjects(vec![dobj.clone()]),
            ));
        }
    }

    fn persist_object(&self, dobj: &DataObjectRef) {
        match postcard::to_allocvec(dobj.as_ref()) {
            Ok(bytes) => {
                if let Err(e) = self.objects.insert(dobj.id(), bytes) {
                    warn!("persisting {}: {}", dobj, e);
                }
            }
            Err(e) => warn!("encoding {}: {}", dobj, e),
        }
    }

    fn persist_node(&self, id: &NodeId) {
        let Some(node) = self.index.get_node(id) else {
            return;
        };
        match postcard::to_allocvec(node) {
            Ok(bytes) => {
                if let Err(e) = self.nodes.insert(id, bytes) {
                    warn!("persisting node {}: {}", node.name, e);
                }
            }
            Err(e) => warn!("encoding node {}: {}", node.name, e),
        }
    }

    fn handle(&mut self, task: DataStoreTask) {
        match task {
            DataStoreTask::InsertDataObject { dobj, reply } => self.insert_data_object(dobj, reply),
            DataStoreTask::DeleteDataObject { id, report } => self.delete_data_object(&id, report),
            DataStoreTask::AgeDataObjects { min_age, reply } => self.age_data_objects(min_age, reply),
            DataStoreTask::InsertNode {
                node,
                merge_bloomfilter,
            } => {
                let id = node.id;
                self.index.insert_node(node, merge_bloomfilter);
                self.persist_node(&id);
            }
            DataStoreTask::RetrieveNode {
                id,
                reply,
                force_reply,
            } => match self.index.get_node(&id) {
                Some(node) => self.post(Event::with_data(
                    EventType::Private(reply),
                    EventData::Node(node.to_node().into_ref()),
                )),
                None if force_reply => self.post(Event::new(EventType::Private(reply))),
                None => {}
            },
            DataStoreTask::RetrieveNodesByType { node_type, reply } => {
                let nodes = self
                    .index
                    .nodes_by_type(node_type)
                    .into_iter()
                    .map(|n| n.to_node().into_ref())
                    .collect();
                self.post(Event::with_data(
                    EventType::Private(reply),
                    EventData::Nodes(nodes),
                ));
            }
            DataStoreTask::AddFilter { filter, match_now } => {
                if match_now {
                    // Bounded replay, delivered before any later insert is
                    // processed so per-filter causal order holds
                    let mut hits = self.index.filter_query(&filter.attributes, filter.min_matches);
                    hits.truncate(FILTER_REPLAY_CAP);
                    if !hits.is_empty() {
                        self.post(Event::with_data(
                            EventType::Private(filter.event),
                            EventData::DataObjects(hits),
                        ));
                    }
                }
                self.index.add_filter(filter);
            }
            DataStoreTask::RemoveFilter { event } => {
                self.index.remove_filter(event);
            }
            DataStoreTask::FilterQuery { filter, reply } => {
                let hits = self.index.filter_query(&filter.attributes, filter.min_matches);
                self.post(Event::with_data(
                    EventType::Private(reply),
                    EventData::DataObjects(hits),
                ));
            }
            DataStoreTask::DataObjectQuery {
                node,
                attr_match_min,
                reply,
            } => {
                let hits = self.index.data_object_query(&node, attr_match_min);
                self.post(Event::with_data(
                    EventType::Private(reply),
                    EventData::NodeAndDataObjects(node.to_node().into_ref(), hits),
                ));
            }
            DataStoreTask::DataObjectsForNodesQuery {
                node,
                delegates,
                attr_match_min,
                reply,
            } => {
                let hits = self
                    .index
                    .data_objects_for_nodes_query(&node, &delegates, attr_match_min);
                self.post(Event::with_data(
                    EventType::Private(reply),
                    EventData::NodeAndDataObjects(node.to_node().into_ref(), hits),
                ));
            }
            DataStoreTask::NodeQuery {
                dobj,
                max_resp,
                attr_match_min,
                ratio_floor,
                reply,
            } => {
                let nodes = self
                    .index
                    .node_query(&dobj, max_resp, attr_match_min, ratio_floor)
                    .into_iter()
                    .map(|n| n.to_node().into_ref())
                    .collect();
                self.post(Event::with_data(
                    EventType::Private(reply),
                    EventData::DataObjectAndNodes(dobj, nodes),
                ));
            }
            DataStoreTask::InsertRepository(entry) => {
                let key = repo_key(&entry.authority, &entry.key);
                match postcard::to_allocvec(&entry) {
                    Ok(bytes) => {
                        if let Err(e) = self.repository.insert(key, bytes) {
                            warn!("persisting repository entry {}: {}", entry, e);
                        }
                    }
                    Err(e) => warn!("encoding repository entry {}: {}", entry, e),
                }
            }
            DataStoreTask::ReadRepository {
                authority,
                key,
                reply,
            } => {
                let mut entries = Vec::new();
                match &key {
                    Some(key) => match self.repository.get(repo_key(&authority, key)) {
                        Ok(Some(bytes)) => match postcard::from_bytes::<RepositoryEntry>(&bytes) {
                            Ok(entry) => entries.push(entry),
                            Err(e) => warn!("undecodable repository row: {}", e),
                        },
                        Ok(None) => {}
                        Err(e) => warn!("repository read: {}", e),
                    },
                    None => {
                        for row in self.repository.scan_prefix(repo_prefix(&authority)) {
                            match row {
                                Ok((_, bytes)) => {
                                    match postcard::from_bytes::<RepositoryEntry>(&bytes) {
                                        Ok(entry) => entries.push(entry),
                                        Err(e) => warn!("undecodable repository row: {}", e),
                                    }
                                }
                                Err(e) => warn!("repository scan: {}", e),
                            }
                        }
                    }
                }
                self.post(Event::with_data(
                    EventType::Private(reply),
                    EventData::Repository(entries),
                ));
            }
            DataStoreTask::DeleteRepository { authority, key } => {
                if let Err(e) = self.repository.remove(repo_key(&authority, &key)) {
                    warn!("removing repository entry {}:{}: {}", authority, key, e);
                }
            }
            DataStoreTask::Shutdown => unreachable!("handled by the thread loop"),
        }
    }

    fn insert_data_object(&mut self, dobj: DataObjectRef, reply: Option<PrivateEventId>) {
        if !dobj.is_persistent() {
            // Evaluate, never store; the object (and any owned payload)
            // disappears when the last ref drops
            self.fire_filters(&dobj);
            if let Some(reply) = reply {
                self.post(Event::with_data(
                    EventType::Private(reply),
                    EventData::DataObject(dobj),
                ));
            }
            return;
        }

        match self.index.insert_object(&dobj) {
            InsertOutcome::Duplicate(_stored) => {
                // Mark the incoming copy so its payload is not unlinked and
                // managers can distinguish duplicate from fresh
                dobj.set_duplicate();
                dobj.set_stored(true);
                debug!("duplicate insert of {}", dobj);
                self.fire_filters(&dobj);
                if let Some(reply) = reply {
                    self.post(Event::with_data(
                        EventType::Private(reply),
                        EventData::DataObject(dobj),
                    ));
                }
            }
            InsertOutcome::ObsoleteDescription => {
                info!("rejecting obsolete node description {}", dobj);
                if let Some(reply) = reply {
                    self.post(Event::with_data(
                        EventType::Private(reply),
                        EventData::DataObject(dobj),
                    ));
                }
            }
            InsertOutcome::Fresh { displaced } => {
                dobj.set_stored(true);
                self.persist_object(&dobj);
                if let Some(old) = displaced {
                    if let Err(e) = self.objects.remove(old.id()) {
                        warn!("removing displaced description: {}", e);
                    }
                    old.set_stored(false);
                    self.post(Event::with_data(
                        EventType::DataObjectDeleted,
                        EventData::DataObjects(vec![old]),
                    ));
                }
                self.post(Event::with_data(
                    EventType::DataObjectNew,
                    EventData::DataObject(dobj.clone()),
                ));
                self.fire_filters(&dobj);
                if let Some(reply) = reply {
                    self.post(Event::with_data(
                        EventType::Private(reply),
                        EventData::DataObject(dobj),
                    ));
                }
            }
        }
    }

    fn delete_data_object(&mut self, id: &DataObjectId, report: bool) {
        let Some(dobj) = self.index.remove_object(id) else {
            return;
        };
        if let Err(e) = self.objects.remove(id) {
            warn!("removing {}: {}", dobj, e);
        }
        dobj.set_stored(false);
        if report {
            self.post(Event::with_data(
                EventType::DataObjectDeleted,
                EventData::DataObjects(vec![dobj]),
            ));
        }
    }

    fn age_data_objects(&mut self, min_age: Duration, reply: Option<PrivateEventId>) {
        let deleted = self
            .index
            .age_objects(min_age, Timestamp::now(), AGE_BATCH_CAP);
        for dobj in &deleted {
            if let Err(e) = self.objects.remove(dobj.id()) {
                warn!("removing aged {}: {}", dobj, e);
            }
            dobj.set_stored(false);
        }
        if !deleted.is_empty() {
            debug!("aged out {} data objects", deleted.len());
            self.post(Event::with_data(
                EventType::DataObjectDeleted,
                EventData::DataObjects(deleted.clone()),
            ));
        }
        if let Some(reply) = reply {
            self.post(Event::with_data(
                EventType::Private(reply),
                EventData::DataObjects(deleted),
            ));
        }
    }
}

fn repo_key(authority: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(authority.len() + key.len() + 1);
    out.extend_from_slice(authority.as_bytes());
    out.push(0);
    out.extend_from_slice(key.as_bytes());
    out
}

fn repo_prefix(authority: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(authority.len() + 1);
    out.extend_from_slice(authority.as_bytes());
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_core::{Attribute, AttributeSet, DataObject};
    use tempfile::tempdir;

    fn object(pairs: &[(&str, &str)], persistent: bool) -> DataObjectRef {
        let attrs: AttributeSet = pairs.iter().map(|(n, v)| Attribute::new(*n, *v)).collect();
        DataObject::from_attributes(attrs, persistent).into_ref()
    }

    async fn expect_event(queue: &EventQueue, etype: EventType) -> Event {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), queue.next())
                .await
                .expect("event within timeout");
            if ev.etype == etype {
                return ev;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscribe_then_publish() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(EventQueue::new());
        let store = spawn(&dir.path().join("haggle.db"), queue.clone()).unwrap();

        let filter_event = PrivateEventId(101);
        store.add_filter(
            Filter::new(
                [Attribute::new("Topic", "weather")].into_iter().collect(),
                filter_event,
            ),
            false,
        );

        let d1 = object(&[("Topic", "weather"), ("City", "Stockholm")], true);
        store.insert_data_object(d1.clone(), None);

        let ev = expect_event(&queue, EventType::Private(filter_event)).await;
        match ev.data {
            EventData::DataObjects(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].id(), d1.id());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_publish_then_subscribe_replays() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(EventQueue::new());
        let store = spawn(&dir.path().join("haggle.db"), queue.clone()).unwrap();

        let d2 = object(&[("Color", "red")], true);
        store.insert_data_object(d2.clone(), None);

        let filter_event = PrivateEventId(102);
        store.add_filter(
            Filter::new(
                [Attribute::new("Color", "red")].into_iter().collect(),
                filter_event,
            ),
            true,
        );

        let ev = expect_event(&queue, EventType::Private(filter_event)).await;
        match ev.data {
            EventData::DataObjects(list) => assert_eq!(list[0].id(), d2.id()),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_insert_flags_copy() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(EventQueue::new());
        let store = spawn(&dir.path().join("haggle.db"), queue.clone()).unwrap();

        let first = object(&[("Topic", "weather")], true);
        let second = object(&[("Topic", "weather")], true);
        assert_eq!(first.id(), second.id());

        let reply = PrivateEventId(200);
        store.insert_data_object(first, None);
        expect_event(&queue, EventType::DataObjectNew).await;

        store.insert_data_object(second.clone(), Some(reply));
        let ev = expect_event(&queue, EventType::Private(reply)).await;
        // The callback still arrives, but flagged duplicate and with no
        // second DataObjectNew in between
        assert!(second.is_duplicate());
        match ev.data {
            EventData::DataObject(d) => assert!(d.is_duplicate()),
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_persistent_evaluated_not_stored() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(EventQueue::new());
        let store = spawn(&dir.path().join("haggle.db"), queue.clone()).unwrap();

        let filter_event = PrivateEventId(103);
        store.add_filter(
            Filter::new(
                [Attribute::new("Control", "shutdown")].into_iter().collect(),
                filter_event,
            ),
            false,
        );
        let ctl = object(&[("Control", "shutdown")], false);
        store.insert_data_object(ctl.clone(), None);

        expect_event(&queue, EventType::Private(filter_event)).await;
        assert!(!ctl.is_stored());
        // Re-inserting works because nothing was stored
        store.insert_data_object(ctl, None);
        expect_event(&queue, EventType::Private(filter_event)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_persistence_across_restart() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("haggle.db");
        let queue = Arc::new(EventQueue::new());

        {
            let store = spawn(&db_path, queue.clone()).unwrap();
            store.insert_data_object(object(&[("Topic", "durable")], true), None);
            expect_event(&queue, EventType::DataObjectNew).await;
            store.shutdown();
            // Give the thread a moment to flush
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let queue2 = Arc::new(EventQueue::new());
        let store2 = spawn(&db_path, queue2.clone()).unwrap();
        let reply = PrivateEventId(50);
        store2.filter_query(
            Filter::new(
                [Attribute::new("Topic", "durable")].into_iter().collect(),
                PrivateEventId(0),
            ),
            reply,
        );
        let ev = expect_event(&queue2, EventType::Private(reply)).await;
        match ev.data {
            EventData::DataObjects(list) => assert_eq!(list.len(), 1),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_repository_roundtrip() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(EventQueue::new());
        let store = spawn(&dir.path().join("haggle.db"), queue.clone()).unwrap();

        store.insert_repository(RepositoryEntry::string("forwarder", "state", "abc"));
        store.insert_repository(RepositoryEntry::blob("forwarder", "blob", vec![1, 2]));
        store.insert_repository(RepositoryEntry::string("other", "state", "zzz"));

        let reply = PrivateEventId(60);
        store.read_repository("forwarder", None, reply);
        let ev = expect_event(&queue, EventType::Private(reply)).await;
        match ev.data {
            EventData::Repository(entries) => {
                assert_eq!(entries.len(), 2);
                assert!(entries.iter().all(|e| e.authority == "forwarder"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        store.delete_repository("forwarder", "state");
        store.read_repository("forwarder", Some("state".into()), reply);
        let ev = expect_event(&queue, EventType::Private(reply)).await;
        match ev.data {
            EventData::Repository(entries) => assert!(entries.is_empty()),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
