//! The event kernel
//!
//! A single task owns the event queue and dispatches each due event to the
//! registered managers. Shared state (stores, the data store handle, the
//! local node) lives in [`KernelCore`], handed to every manager at
//! construction instead of through globals.

use crate::datastore::DataStoreHandle;
use crate::event::{Event, EventQueue, EventType, PrivateEventId};
use crate::interface_store::InterfaceStore;
use crate::manager::Manager;
use crate::node_store::NodeStore;
use haggle_core::NodeRef;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, trace};

#[derive(Default)]
struct Lifecycle {
    registered: BTreeSet<&'static str>,
    ready: BTreeSet<&'static str>,
}

/// Shared kernel context
pub struct KernelCore {
    queue: Arc<EventQueue>,
    node_store: NodeStore,
    interface_store: InterfaceStore,
    datastore: OnceLock<DataStoreHandle>,
    this_node: NodeRef,
    storage_path: PathBuf,
    next_private: AtomicU32,
    lifecycle: Mutex<Lifecycle>,
}

impl KernelCore {
    pub fn new(this_node: NodeRef, storage_path: PathBuf) -> Arc<KernelCore> {
        Arc::new(KernelCore {
            queue: Arc::new(EventQueue::new()),
            node_store: NodeStore::new(),
            interface_store: InterfaceStore::new(),
            datastore: OnceLock::new(),
            this_node,
            storage_path,
            next_private: AtomicU32::new(1),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Enqueue for immediate dispatch
    pub fn post(&self, event: Event) {
        self.queue.push(event);
    }

    /// Enqueue for dispatch after `delay`
    pub fn post_delayed(&self, event: Event, delay: Duration) {
        self.queue.push_delayed(event, delay);
    }

    pub fn node_store(&self) -> &NodeStore {
        &self.node_store
    }

    pub fn interface_store(&self) -> &InterfaceStore {
        &self.interface_store
    }

    pub fn this_node(&self) -> &NodeRef {
        &self.this_node
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Attach the data store handle; called once during daemon assembly,
    /// before any manager runs
    pub fn attach_datastore(&self, handle: DataStoreHandle) {
        if self.datastore.set(handle).is_err() {
            debug!("data store handle already attached");
        }
    }

    pub fn datastore(&self) -> &DataStoreHandle {
        self.datastore
            .get()
            .expect("data store attached during assembly")
    }

    /// Allocate a fresh private event id
    pub fn new_private_event(&self) -> PrivateEventId {
        PrivateEventId(self.next_private.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register_manager(&self, name: &'static str) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.registered.insert(name);
    }

    pub fn unregister_manager(&self, name: &'static str) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.registered.remove(name);
        lifecycle.ready.remove(name);
        debug!("manager {} unregistered, {} left", name, lifecycle.registered.len());
    }

    pub fn registered_count(&self) -> usize {
        self.lifecycle.lock().registered.len()
    }

    pub fn signal_ready_for_startup(&self, name: &'static str) {
        if self.signal_ready(name) {
            info!("all managers ready, starting up");
            self.post(Event::new(EventType::Startup));
        }
    }

    pub fn signal_ready_for_shutdown(&self, name: &'static str) {
        if self.signal_ready(name) {
            info!("all managers ready for shutdown");
            self.post(Event::new(EventType::Shutdown));
        }
    }

    fn signal_ready(&self, name: &'static str) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.ready.insert(name);
        if lifecycle.ready.len() >= lifecycle.registered.len() {
            lifecycle.ready.clear();
            true
        } else {
            false
        }
    }

    /// Begin the shutdown sequence: the queue yields a synthetic
    /// `PrepareShutdown` ahead of everything else and pending delays
    /// collapse so timed events fire immediately
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.queue.shutdown();
    }
}

/// The kernel loop: owns the managers and dispatches events to them
pub struct Kernel {
    core: Arc<KernelCore>,
    managers: Vec<Box<dyn Manager>>,
}

impl Kernel {
    pub fn new(core: Arc<KernelCore>) -> Kernel {
        Kernel {
            core,
            managers: Vec::new(),
        }
    }

    pub fn core(&self) -> &Arc<KernelCore> {
        &self.core
    }

    pub fn register(&mut self, manager: Box<dyn Manager>) {
        self.core.register_manager(manager.name());
        debug!("registered manager {}", manager.name());
        self.managers.push(manager);
    }

    /// Run until the registered-manager set becomes empty
    pub async fn run(&mut self) {
        if self.managers.is_empty() {
            return;
        }
        self.core.post(Event::new(EventType::PrepareStartup));

        loop {
            let event = self.core.queue.next().await;
            trace!("dispatching {:?}", event.etype);

            for manager in self.managers.iter_mut() {
                match event.etype {
                    EventType::PrepareStartup => manager.on_prepare_startup(),
                    EventType::Startup => manager.on_startup(),
                    EventType::PrepareShutdown => manager.on_prepare_shutdown(),
                    EventType::Shutdown => manager.on_shutdown(),
                    _ => {
                        if manager.wants(&event.etype) {
                            manager.on_event(&event);
                        }
                    }
                }
            }

            if self.core.registered_count() == 0 {
                info!("no managers registered, kernel exiting");
                break;
            }
        }
    }
}
