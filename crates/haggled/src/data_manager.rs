//! Data manager
//!
//! Lands received data objects in the data store, keeps the local node's
//! counting bloom filter in sync with what this node has seen, and drives
//! the periodic aging sweep on the kernel timer.

use crate::event::{Event, EventData, EventType, PrivateEventId};
use crate::kernel::KernelCore;
use crate::manager::Manager;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct DataManagerConfig {
    /// Objects older than this and matching no filter are aged out
    pub max_age: Duration,
    /// How often the aging sweep runs
    pub age_period: Duration,
}

impl Default for DataManagerConfig {
    fn default() -> Self {
        DataManagerConfig {
            max_age: Duration::from_secs(24 * 3600),
            age_period: Duration::from_secs(3600),
        }
    }
}

pub struct DataManager {
    core: Arc<KernelCore>,
    config: DataManagerConfig,
    age_tick: PrivateEventId,
    insert_done: PrivateEventId,
}

impl DataManager {
    pub fn new(core: Arc<KernelCore>, config: DataManagerConfig) -> DataManager {
        let age_tick = core.new_private_event();
        let insert_done = core.new_private_event();
        DataManager {
            core,
            config,
            age_tick,
            insert_done,
        }
    }

    fn schedule_age_tick(&self) {
        self.core.post_delayed(
            Event::new(EventType::Private(self.age_tick)),
            self.config.age_period,
        );
    }
}

impl Manager for DataManager {
    fn name(&self) -> &'static str {
        "data"
    }

    fn core(&self) -> &Arc<KernelCore> {
        &self.core
    }

    fn wants(&self, etype: &EventType) -> bool {
        match etype {
            EventType::DataObjectReceived => true,
            EventType::Private(id) => *id == self.age_tick || *id == self.insert_done,
            _ => false,
        }
    }

    fn on_startup(&mut self) {
        self.schedule_age_tick();
    }

    fn on_event(&mut self, event: &Event) {
        match &event.etype {
            EventType::DataObjectReceived => {
                let Some(dobj) = event.data_object() else {
                    return;
                };
                // What we received, we have: track it locally so peers are
                // not re-sent this object and queries exclude it
                self.core.this_node().write().bloomfilter_add(dobj.id());
                self.core
                    .datastore()
                    .insert_data_object(dobj.clone(), Some(self.insert_done));
            }
            EventType::Private(id) if *id == self.age_tick => {
                debug!("running data object aging sweep");
                self.core
                    .datastore()
                    .age_data_objects(self.config.max_age, None);
                self.schedule_age_tick();
            }
            EventType::Private(id) if *id == self.insert_done => {
                if let EventData::DataObject(dobj) = &event.data {
                    if dobj.is_duplicate() {
                        debug!("received {} was a duplicate", dobj);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_core::{Attribute, AttributeSet, DataObject, Node};

    #[tokio::test(flavor = "multi_thread")]
    async fn test_received_object_is_stored_and_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::this_node("dm-test", &[[2, 0, 0, 1, 0, 1]]).into_ref();
        let core = KernelCore::new(node, dir.path().to_path_buf());
        let datastore =
            crate::datastore::spawn(&dir.path().join("haggle.db"), core.queue().clone()).unwrap();
        core.attach_datastore(datastore);

        let mut manager = DataManager::new(core.clone(), DataManagerConfig::default());
        let attrs: AttributeSet = [Attribute::new("Topic", "weather")].into_iter().collect();
        let dobj = DataObject::from_attributes(attrs, true).into_ref();

        manager.on_event(&Event::with_data(
            EventType::DataObjectReceived,
            EventData::DataObject(dobj.clone()),
        ));

        assert!(core.this_node().read().has_data_object(dobj.id()));
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), core.queue().next())
                .await
                .expect("event in time");
            if ev.etype == EventType::DataObjectNew {
                assert_eq!(ev.data_object().unwrap().id(), dobj.id());
                break;
            }
        }
    }
}
