//! Reference-counted store of known interfaces with aging policies
//!
//! The store contains the local interfaces plus every remote interface
//! reachable through one of them (the parent). One mutex guards the store
//! structure; interface values carry their own lock, and holders of a ref
//! never need the store lock. Lock order is store, then value, never the
//! reverse.

use haggle_core::{Interface, InterfaceKey, InterfaceKind, InterfaceRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Expiry strategy attached to an interface when it is inserted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgingPolicy {
    /// Never expires (local interfaces)
    Ageless,
    /// Expires after `max_missed` report intervals without a re-report
    Ttl { interval: Duration, max_missed: u32 },
    /// Expires at a fixed deadline (beacon-derived lifetimes)
    AbsoluteTime(Instant),
}

struct Entry {
    iface: InterfaceRef,
    parent: Option<InterfaceKey>,
    policy: AgingPolicy,
    last_report: Instant,
}

impl Entry {
    fn deadline(&self) -> Option<Instant> {
        match self.policy {
            AgingPolicy::Ageless => None,
            AgingPolicy::Ttl {
                interval,
                max_missed,
            } => Some(self.last_report + interval * max_missed),
            AgingPolicy::AbsoluteTime(at) => Some(at),
        }
    }
}

/// In-memory index of live interfaces
#[derive(Default)]
pub struct InterfaceStore {
    inner: Mutex<HashMap<InterfaceKey, Entry>>,
}

impl InterfaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an interface. An existing record keeps its ref;
    /// its addresses are refreshed, it is marked up, and the policy is
    /// replaced. Returns the shared ref and whether the record was added.
    pub fn add_or_update(
        &self,
        iface: Interface,
        parent: Option<InterfaceKey>,
        policy: AgingPolicy,
    ) -> (InterfaceRef, bool) {
        let key = iface.key();
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&key) {
            {
                let mut existing = entry.iface.write();
                for addr in iface.addresses() {
                    existing.add_address(addr.clone());
                }
                existing.set_up(true);
            }
            entry.policy = policy;
            entry.last_report = Instant::now();
            return (entry.iface.clone(), false);
        }

        let iface_ref = {
            let mut iface = iface;
            iface.set_up(true);
            iface.set_stored(true);
            iface.into_ref()
        };
        inner.insert(
            key,
            Entry {
                iface: iface_ref.clone(),
                parent,
                policy,
                last_report: Instant::now(),
            },
        );
        (iface_ref, true)
    }

    pub fn retrieve(&self, key: &InterfaceKey) -> Option<InterfaceRef> {
        self.inner.lock().get(key).map(|e| e.iface.clone())
    }

    pub fn contains(&self, key: &InterfaceKey) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn retrieve_by_kind(&self, kind: InterfaceKind) -> Vec<InterfaceRef> {
        self.inner
            .lock()
            .values()
            .filter(|e| e.iface.read().kind() == kind)
            .map(|e| e.iface.clone())
            .collect()
    }

    /// All interfaces carrying the LOCAL flag
    pub fn local_interfaces(&self) -> Vec<InterfaceRef> {
        self.inner
            .lock()
            .values()
            .filter(|e| e.iface.read().is_local())
            .map(|e| e.iface.clone())
            .collect()
    }

    /// Remote interfaces attached to the given local parent
    pub fn children_of(&self, parent: &InterfaceKey) -> Vec<InterfaceRef> {
        self.inner
            .lock()
            .values()
            .filter(|e| e.parent.as_ref() == Some(parent))
            .map(|e| e.iface.clone())
            .collect()
    }

    /// Remove one interface, marking it down
    pub fn remove(&self, key: &InterfaceKey) -> Option<InterfaceRef> {
        let entry = self.inner.lock().remove(key)?;
        {
            let mut iface = entry.iface.write();
            iface.set_up(false);
            iface.set_stored(false);
        }
        Some(entry.iface)
    }

    /// Remove every interface with the given name, returning them
    pub fn remove_by_name(&self, name: &str) -> Vec<InterfaceRef> {
        let mut inner = self.inner.lock();
        let keys: Vec<InterfaceKey> = inner
            .iter()
            .filter(|(_, e)| e.iface.read().name() == name)
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = inner.remove(&key) {
                let mut iface = entry.iface.write();
                iface.set_up(false);
                iface.set_stored(false);
                drop(iface);
                removed.push(entry.iface);
            }
        }
        removed
    }

    /// Remove every interface attached to the given parent, returning them
    pub fn remove_children(&self, parent: &InterfaceKey) -> Vec<InterfaceRef> {
        let mut inner = self.inner.lock();
        let keys: Vec<InterfaceKey> = inner
            .iter()
            .filter(|(_, e)| e.parent.as_ref() == Some(parent))
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = inner.remove(&key) {
                let mut iface = entry.iface.write();
                iface.set_up(false);
                iface.set_stored(false);
                drop(iface);
                removed.push(entry.iface);
            }
        }
        removed
    }

    /// Expire interfaces past their deadline. Restricted to children of
    /// `parent` when given. Returns the interfaces that died in this pass
    /// and the soonest next deadline among the survivors.
    pub fn age(
        &self,
        parent: Option<&InterfaceKey>,
        now: Instant,
    ) -> (Vec<InterfaceRef>, Option<Instant>) {
        let mut inner = self.inner.lock();
        let mut dead_keys = Vec::new();
        let mut next: Option<Instant> = None;

        for (key, entry) in inner.iter() {
            if let Some(parent) = parent {
                if entry.parent.as_ref() != Some(parent) {
                    continue;
                }
            }
            match entry.deadline() {
                Some(deadline) if deadline <= now => dead_keys.push(key.clone()),
                Some(deadline) => {
                    next = Some(match next {
                        Some(n) => n.min(deadline),
                        None => deadline,
                    });
                }
                None => {}
            }
        }

        let mut dead = Vec::with_capacity(dead_keys.len());
        for key in dead_keys {
            if let Some(entry) = inner.remove(&key) {
                let mut iface = entry.iface.write();
                iface.set_up(false);
                iface.set_stored(false);
                drop(iface);
                dead.push(entry.iface);
            }
        }
        (dead, next)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
