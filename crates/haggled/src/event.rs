//! Events and the priority event queue
//!
//! The kernel multiplexes a single min-heap of deadline-ordered events.
//! Pushes from any thread raise a wake signal so an enqueue interrupts any
//! pending wait. Setting the shutdown flag makes the next pop yield a
//! synthetic shutdown event ahead of everything else and collapses all
//! pending delays.

use haggle_core::{DataObjectRef, InterfaceRef, NodeRef, RepositoryEntry};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Dynamically allocated event type for one-shot callbacks and filter
/// notifications; delivered only to the manager that registered it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrivateEventId(pub u32);

impl fmt::Display for PrivateEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "private#{}", self.0)
    }
}

/// The public event vocabulary plus the private range
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    PrepareStartup,
    Startup,
    PrepareShutdown,
    Shutdown,
    NodeContactNew,
    NodeContactEnd,
    NodeUpdated,
    NodeDescriptionSend,
    NeighborInterfaceUp,
    NeighborInterfaceDown,
    LocalInterfaceUp,
    LocalInterfaceDown,
    DataObjectNew,
    DataObjectDeleted,
    DataObjectForward,
    DataObjectSend,
    DataObjectVerified,
    DataObjectReceived,
    DataObjectSendSuccessful,
    DataObjectSendFailure,
    DataObjectIncoming,
    TargetNodes,
    DelegateNodes,
    ResourcePolicyNew,
    DebugCmd,
    Private(PrivateEventId),
}

impl EventType {
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EventType::PrepareStartup
                | EventType::Startup
                | EventType::PrepareShutdown
                | EventType::Shutdown
        )
    }
}

/// Resource availability levels pushed by an external policy monitor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourcePolicy {
    Unlimited,
    High,
    Medium,
    Low,
}

impl ResourcePolicy {
    /// Beacon interval this policy maps to
    pub fn beacon_interval(&self) -> Duration {
        match self {
            ResourcePolicy::Unlimited => Duration::from_secs(2),
            ResourcePolicy::High => Duration::from_secs(5),
            ResourcePolicy::Medium => Duration::from_secs(10),
            ResourcePolicy::Low => Duration::from_secs(15),
        }
    }
}

/// Payload variants of an event
#[derive(Clone, Debug, Default)]
pub enum EventData {
    #[default]
    None,
    DataObject(DataObjectRef),
    DataObjects(Vec<DataObjectRef>),
    Node(NodeRef),
    Nodes(Vec<NodeRef>),
    Interface(InterfaceRef),
    DataObjectAndNode(DataObjectRef, NodeRef),
    DataObjectAndNodes(DataObjectRef, Vec<NodeRef>),
    NodeAndNodes(NodeRef, Vec<NodeRef>),
    NodeAndDataObjects(NodeRef, Vec<DataObjectRef>),
    Policy(ResourcePolicy),
    Repository(Vec<RepositoryEntry>),
}

/// One event: a type, a payload and (once queued) a deadline
#[derive(Clone, Debug)]
pub struct Event {
    pub etype: EventType,
    pub data: EventData,
}

impl Event {
    pub fn new(etype: EventType) -> Self {
        Event {
            etype,
            data: EventData::None,
        }
    }

    pub fn with_data(etype: EventType, data: EventData) -> Self {
        Event { etype, data }
    }

    pub fn data_object(&self) -> Option<&DataObjectRef> {
        match &self.data {
            EventData::DataObject(d)
            | EventData::DataObjectAndNode(d, _)
            | EventData::DataObjectAndNodes(d, _) => Some(d),
            _ => None,
        }
    }

    pub fn node(&self) -> Option<&NodeRef> {
        match &self.data {
            EventData::Node(n)
            | EventData::DataObjectAndNode(_, n)
            | EventData::NodeAndNodes(n, _)
            | EventData::NodeAndDataObjects(n, _) => Some(n),
            _ => None,
        }
    }

    pub fn interface(&self) -> Option<&InterfaceRef> {
        match &self.data {
            EventData::Interface(i) => Some(i),
            _ => None,
        }
    }
}

struct Scheduled {
    when: Instant,
    seq: u64,
    event: Event,
}

// Min-heap on (when, seq); seq keeps same-deadline events FIFO
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Scheduled>,
    seq: u64,
    shutdown_emitted: bool,
}

/// The kernel's deadline-ordered event queue
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    shutdown: AtomicBool,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueue for immediate dispatch
    pub fn push(&self, event: Event) {
        self.push_at(event, Instant::now());
    }

    /// Enqueue for dispatch after `delay`
    pub fn push_delayed(&self, event: Event, delay: Duration) {
        self.push_at(event, Instant::now() + delay);
    }

    fn push_at(&self, event: Event, when: Instant) {
        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(Scheduled { when, seq, event });
        drop(inner);
        self.notify.notify_one();
    }

    /// Raise the shutdown flag: the next pop yields a synthetic
    /// `PrepareShutdown` ahead of all queued events, and every pending
    /// delay collapses to "now"
    pub fn shutdown(&self) {
        self.shutdown.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(AtomicOrdering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    /// Wait for and pop the next due event. Kernel-loop use only: there must
    /// be a single consumer.
    pub async fn next(&self) -> Event {
        loop {
            let deadline = {
                let mut inner = self.inner.lock();
                let draining = self.is_shutdown();
                if draining && !inner.shutdown_emitted {
                    inner.shutdown_emitted = true;
                    return Event::new(EventType::PrepareShutdown);
                }
                let due = match inner.heap.peek() {
                    Some(s) => draining || s.when <= Instant::now(),
                    None => false,
                };
                if due {
                    return inner.heap.pop().expect("peeked entry present").event;
                }
                inner.heap.peek().map(|s| s.when)
            };

            match deadline {
                Some(when) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(when) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fifo_for_same_deadline() {
        let q = EventQueue::new();
        q.push(Event::new(EventType::DataObjectNew));
        q.push(Event::new(EventType::NodeUpdated));
        q.push(Event::new(EventType::DebugCmd));

        assert_eq!(q.next().await.etype, EventType::DataObjectNew);
        assert_eq!(q.next().await.etype, EventType::NodeUpdated);
        assert_eq!(q.next().await.etype, EventType::DebugCmd);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_ordering() {
        let q = EventQueue::new();
        q.push_delayed(Event::new(EventType::DebugCmd), Duration::from_secs(10));
        q.push_delayed(Event::new(EventType::NodeUpdated), Duration::from_secs(1));

        assert_eq!(q.next().await.etype, EventType::NodeUpdated);
        assert_eq!(q.next().await.etype, EventType::DebugCmd);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_interrupts_wait() {
        let q = Arc::new(EventQueue::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.next().await.etype });
        // Give the waiter a chance to park
        tokio::task::yield_now().await;
        q.push(Event::new(EventType::DataObjectNew));
        assert_eq!(waiter.await.unwrap(), EventType::DataObjectNew);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_preempts_and_collapses_delays() {
        let q = EventQueue::new();
        q.push_delayed(Event::new(EventType::DebugCmd), Duration::from_secs(3600));
        q.shutdown();

        // Synthetic shutdown event first, then the delayed event fires
        // immediately instead of in an hour
        assert_eq!(q.next().await.etype, EventType::PrepareShutdown);
        assert_eq!(q.next().await.etype, EventType::DebugCmd);
    }

    #[test]
    fn test_policy_intervals() {
        assert_eq!(
            ResourcePolicy::Unlimited.beacon_interval(),
            Duration::from_secs(2)
        );
        assert_eq!(
            ResourcePolicy::Low.beacon_interval(),
            Duration::from_secs(15)
        );
    }
}
