//! Application IPC endpoint
//!
//! A loopback datagram socket carries control data objects between client
//! libraries and the core. Clients register by name, manage their interest
//! sets (which become data-store filters), and receive matched data objects
//! back as asynchronous datagrams. Clients appear in the node store as
//! application nodes with an `application_port` interface.

use crate::event::{Event, EventData, EventType, PrivateEventId};
use crate::kernel::KernelCore;
use crate::manager::Manager;
use crate::matching::{Filter, StoredNode};
use haggle_core::{
    Attribute, AttributeSet, DataObject, DataObjectRef, Interface, Node, NodeRef, NodeType,
    DATAOBJECT_ID_LEN,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default loopback port of the IPC endpoint
pub const IPC_DEFAULT_PORT: u16 = 8787;

pub const CONTROL_ATTR: &str = "Control";
pub const APPLICATION_NAME_ATTR: &str = "ApplicationName";
pub const SESSION_ID_ATTR: &str = "SessionId";
pub const DIRECTORY_ATTR: &str = "HaggleDirectory";
pub const EVENT_ATTR: &str = "Event";
pub const DATAOBJECT_ID_ATTR: &str = "DataObjectId";

pub const CONTROL_REGISTRATION_REQUEST: &str = "registration_request";
pub const CONTROL_REGISTRATION_REPLY: &str = "registration_reply";
pub const CONTROL_REGISTRATION_REPLY_REGISTERED: &str = "registration_reply_registered";
pub const CONTROL_DEREGISTRATION_NOTICE: &str = "deregistration_notice";
pub const CONTROL_ADD_INTEREST: &str = "add_interest";
pub const CONTROL_REMOVE_INTEREST: &str = "remove_interest";
pub const CONTROL_GET_INTERESTS: &str = "get_interests";
pub const CONTROL_GET_DATAOBJECTS: &str = "get_dataobjects";
pub const CONTROL_REGISTER_EVENT_INTEREST: &str = "register_event_interest";
pub const CONTROL_DELETE_DATAOBJECT: &str = "delete_dataobject";
pub const CONTROL_SHUTDOWN: &str = "shutdown";
pub const CONTROL_EVENT: &str = "event";

/// Numeric event ids visible to clients
pub const EVENT_HAGGLE_SHUTDOWN: u32 = 0;
pub const EVENT_NEIGHBOR_UPDATE: u32 = 1;
pub const EVENT_NEW_DATAOBJECT: u32 = 2;
pub const EVENT_INTEREST_LIST: u32 = 3;

/// Attribute names that are control plumbing, not interests
const PLUMBING_ATTRS: [&str; 4] = [
    CONTROL_ATTR,
    APPLICATION_NAME_ATTR,
    SESSION_ID_ATTR,
    EVENT_ATTR,
];

struct Session {
    name: String,
    session_id: u32,
    node: NodeRef,
    addr: SocketAddr,
    filter_event: PrivateEventId,
    event_interests: HashSet<u32>,
}

type Inbox = Arc<Mutex<VecDeque<(DataObjectRef, SocketAddr)>>>;

pub struct ApplicationManager {
    core: Arc<KernelCore>,
    port: u16,
    socket: Option<Arc<UdpSocket>>,
    inbox: Inbox,
    ipc_event: PrivateEventId,
    sessions: HashMap<String, Session>,
    cancel: Option<watch::Sender<bool>>,
}

impl ApplicationManager {
    pub fn new(core: Arc<KernelCore>, port: u16) -> ApplicationManager {
        let ipc_event = core.new_private_event();
        ApplicationManager {
            core,
            port,
            socket: None,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            ipc_event,
            sessions: HashMap::new(),
            cancel: None,
        }
    }

    fn session_by_event(&self, id: PrivateEventId) -> Option<&Session> {
        self.sessions.values().find(|s| s.filter_event == id)
    }

    fn session_for(&self, dobj: &DataObjectRef) -> Option<&str> {
        // Prefer the session id; fall back to the application name
        if let Some(attr) = dobj.get_attribute(SESSION_ID_ATTR) {
            let id: u32 = attr.value().parse().ok()?;
            return self
                .sessions
                .values()
                .find(|s| s.session_id == id)
                .map(|s| s.name.as_str());
        }
        let name = dobj.get_attribute(APPLICATION_NAME_ATTR)?.value();
        self.sessions.get(name).map(|s| s.name.as_str())
    }

    fn send_to_client(&self, dobj: &DataObject, addr: SocketAddr) {
        let Some(socket) = &self.socket else {
            return;
        };
        match dobj.metadata_bytes() {
            Ok(bytes) => {
                if let Err(e) = socket.try_send_to(&bytes, addr) {
                    debug!("ipc send to {}: {}", addr, e);
                }
            }
            Err(e) => warn!("ipc encode: {}", e),
        }
    }

    fn reply(&self, addr: SocketAddr, attrs: AttributeSet) {
        self.send_to_client(&DataObject::from_attributes(attrs, false), addr);
    }

    fn handle_control(&mut self, dobj: DataObjectRef, addr: SocketAddr) {
        let Some(control) = dobj.get_attribute(CONTROL_ATTR).map(|a| a.value().to_string())
        else {
            debug!("ignoring ipc datagram without control attribute from {}", addr);
            return;
        };

        match control.as_str() {
            CONTROL_REGISTRATION_REQUEST => self.register(dobj, addr),
            CONTROL_DEREGISTRATION_NOTICE => self.deregister(&dobj),
            CONTROL_ADD_INTEREST => self.modify_interests(&dobj, true),
            CONTROL_REMOVE_INTEREST => self.modify_interests(&dobj, false),
            CONTROL_GET_INTERESTS => self.send_interest_list(&dobj),
            CONTROL_GET_DATAOBJECTS => {
                if let Some(name) = self.session_for(&dobj).map(str::to_string) {
                    let session = &self.sessions[&name];
                    let interests = session.node.read().interests().clone();
                    self.core.datastore().filter_query(
                        Filter::new(interests, session.filter_event),
                        session.filter_event,
                    );
                }
            }
            CONTROL_REGISTER_EVENT_INTEREST => {
                let event_id = dobj
                    .get_attribute(EVENT_ATTR)
                    .and_then(|a| a.value().parse::<u32>().ok());
                if let (Some(name), Some(event_id)) =
                    (self.session_for(&dobj).map(str::to_string), event_id)
                {
                    if let Some(session) = self.sessions.get_mut(&name) {
                        session.event_interests.insert(event_id);
                    }
                }
            }
            CONTROL_DELETE_DATAOBJECT => {
                let id = dobj
                    .get_attribute(DATAOBJECT_ID_ATTR)
                    .and_then(|a| BASE64.decode(a.value().trim()).ok())
                    .and_then(|b| <[u8; DATAOBJECT_ID_LEN]>::try_from(b.as_slice()).ok());
                match id {
                    Some(id) => self.core.datastore().delete_data_object(id, true),
                    None => debug!("delete_dataobject without a valid id from {}", addr),
                }
            }
            CONTROL_SHUTDOWN => {
                info!("shutdown requested over ipc by {}", addr);
                self.core.shutdown();
            }
            other => debug!("unknown control value '{}' from {}", other, addr),
        }
    }

    fn register(&mut self, dobj: DataObjectRef, addr: SocketAddr) {
        let Some(name) = dobj
            .get_attribute(APPLICATION_NAME_ATTR)
            .map(|a| a.value().to_string())
        else {
            debug!("registration without application name from {}", addr);
            return;
        };

        if let Some(existing) = self.sessions.get(&name) {
            info!("application '{}' already registered", name);
            let attrs: AttributeSet = [
                Attribute::new(CONTROL_ATTR, CONTROL_REGISTRATION_REPLY_REGISTERED),
                Attribute::new(SESSION_ID_ATTR, existing.session_id.to_string()),
            ]
            .into_iter()
            .collect();
            self.reply(addr, attrs);
            return;
        }

        let session_id: u32 = rand::random();
        let mut node = Node::application(&name);
        let iface = Interface::application_port(addr.port()).into_ref();
        iface.write().set_up(true);
        node.add_interface(iface);
        let node = node.into_ref();
        self.core.node_store().add(node.clone());
        self.core
            .datastore()
            .insert_node(StoredNode::from_node(&node.read()), false);

        let filter_event = self.core.new_private_event();
        info!(
            "registered application '{}' at {} (session {})",
            name, addr, session_id
        );
        self.sessions.insert(
            name.clone(),
            Session {
                name,
                session_id,
                node,
                addr,
                filter_event,
                event_interests: HashSet::new(),
            },
        );

        let attrs: AttributeSet = [
            Attribute::new(CONTROL_ATTR, CONTROL_REGISTRATION_REPLY),
            Attribute::new(SESSION_ID_ATTR, session_id.to_string()),
            Attribute::new(
                DIRECTORY_ATTR,
                self.core.storage_path().display().to_string(),
            ),
        ]
        .into_iter()
        .collect();
        self.reply(addr, attrs);
    }

    fn deregister(&mut self, dobj: &DataObjectRef) {
        let Some(name) = self.session_for(dobj).map(str::to_string) else {
            return;
        };
        if let Some(session) = self.sessions.remove(&name) {
            info!("application '{}' deregistered", session.name);
            self.core.datastore().remove_filter(session.filter_event);
            let id = *session.node.read().id();
            self.core.node_store().remove(&id);
        }
    }

    fn modify_interests(&mut self, dobj: &DataObjectRef, add: bool) {
        let Some(name) = self.session_for(dobj).map(str::to_string) else {
            debug!("interest change for unknown session");
            return;
        };
        let Some(session) = self.sessions.get(&name) else {
            return;
        };

        let interests: Vec<Attribute> = dobj
            .attributes()
            .iter()
            .filter(|a| !PLUMBING_ATTRS.contains(&a.name()))
            .cloned()
            .collect();

        {
            let mut node = session.node.write();
            for attr in interests {
                if add {
                    node.add_interest(attr);
                } else {
                    node.remove_interest(attr.name(), attr.value());
                }
            }
        }

        let node = session.node.read();
        // Refresh the data-store filter and the application node row so both
        // local matching and remote descriptions see the new interest set
        self.core
            .datastore()
            .add_filter(Filter::new(node.interests().clone(), session.filter_event), false);
        self.core
            .datastore()
            .insert_node(StoredNode::from_node(&node), false);
    }

    fn send_interest_list(&self, dobj: &DataObjectRef) {
        let Some(name) = self.session_for(dobj) else {
            return;
        };
        let session = &self.sessions[name];
        let mut attrs: AttributeSet = [
            Attribute::new(CONTROL_ATTR, CONTROL_EVENT),
            Attribute::new(EVENT_ATTR, EVENT_INTEREST_LIST.to_string()),
        ]
        .into_iter()
        .collect();
        for interest in session.node.read().interests() {
            attrs.add(interest.clone());
        }
        self.reply(session.addr, attrs);
    }

    fn broadcast_event(&self, event_id: u32, extra: &[Attribute]) {
        for session in self.sessions.values() {
            if !session.event_interests.contains(&event_id) {
                continue;
            }
            let mut attrs: AttributeSet = [
                Attribute::new(CONTROL_ATTR, CONTROL_EVENT),
                Attribute::new(EVENT_ATTR, event_id.to_string()),
            ]
            .into_iter()
            .collect();
            for attr in extra {
                attrs.add(attr.clone());
            }
            self.reply(session.addr, attrs);
        }
    }
}

impl Manager for ApplicationManager {
    fn name(&self) -> &'static str {
        "application"
    }

    fn core(&self) -> &Arc<KernelCore> {
        &self.core
    }

    fn wants(&self, etype: &EventType) -> bool {
        match etype {
            EventType::NodeContactNew | EventType::NodeContactEnd => true,
            EventType::Private(id) => {
                *id == self.ipc_event || self.session_by_event(*id).is_some()
            }
            _ => false,
        }
    }

    fn on_prepare_startup(&mut self) {
        let bind = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port));
        match std::net::UdpSocket::bind(bind) {
            Ok(socket) => {
                socket
                    .set_nonblocking(true)
                    .expect("nonblocking mode on a fresh socket");
                match UdpSocket::from_std(socket) {
                    Ok(socket) => {
                        let socket = Arc::new(socket);
                        info!("application ipc endpoint on {}", bind);
                        let (cancel_tx, cancel_rx) = watch::channel(false);
                        self.cancel = Some(cancel_tx);
                        tokio::spawn(recv_task(
                            self.core.clone(),
                            socket.clone(),
                            self.inbox.clone(),
                            self.ipc_event,
                            cancel_rx,
                        ));
                        self.socket = Some(socket);
                    }
                    Err(e) => warn!("ipc socket registration failed: {}", e),
                }
            }
            Err(e) => warn!("could not bind ipc endpoint on {}: {}", bind, e),
        }
        let core = self.core.clone();
        core.signal_ready_for_startup(self.name());
    }

    fn on_event(&mut self, event: &Event) {
        match &event.etype {
            EventType::Private(id) if *id == self.ipc_event => {
                // One unit of work per wakeup
                let item = self.inbox.lock().pop_front();
                if let Some((dobj, addr)) = item {
                    self.handle_control(dobj, addr);
                }
            }
            EventType::Private(id) => {
                let Some(session) = self.session_by_event(*id) else {
                    return;
                };
                if let EventData::DataObjects(list) = &event.data {
                    debug!(
                        "forwarding {} data objects to application '{}'",
                        list.len(),
                        session.name
                    );
                    let addr = session.addr;
                    for dobj in list {
                        self.send_to_client(dobj, addr);
                    }
                }
            }
            EventType::NodeContactNew | EventType::NodeContactEnd => {
                let extra: Vec<Attribute> = event
                    .node()
                    .map(|n| vec![Attribute::new("Neighbor", n.read().name())])
                    .unwrap_or_default();
                self.broadcast_event(EVENT_NEIGHBOR_UPDATE, &extra);
            }
            _ => {}
        }
    }

    fn on_prepare_shutdown(&mut self) {
        self.broadcast_event(EVENT_HAGGLE_SHUTDOWN, &[]);
        for session in self.sessions.values() {
            self.core.datastore().remove_filter(session.filter_event);
        }
        self.sessions.clear();
        self.core.node_store().remove_by_type(NodeType::Application);
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        let core = self.core.clone();
        core.signal_ready_for_shutdown(self.name());
    }
}

async fn recv_task(
    core: Arc<KernelCore>,
    socket: Arc<UdpSocket>,
    inbox: Inbox,
    ipc_event: PrivateEventId,
    mut cancel: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => match DataObject::from_metadata_bytes(&buf[..len]) {
                        Ok(dobj) => {
                            inbox.lock().push_back((dobj.into_ref(), src));
                            core.post(Event::new(EventType::Private(ipc_event)));
                        }
                        Err(e) => debug!("undecodable ipc datagram from {}: {}", src, e),
                    },
                    Err(e) => {
                        warn!("ipc recv: {}", e);
                    }
                }
            }
            _ = cancel.changed() => break,
        }
    }
    debug!("ipc receive task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_core() -> Arc<KernelCore> {
        let node = Node::this_node("app-test", &[[2, 0, 0, 0, 7, 1]]).into_ref();
        KernelCore::new(node, std::env::temp_dir())
    }

    fn control_object(pairs: &[(&str, &str)]) -> DataObjectRef {
        let attrs: AttributeSet = pairs.iter().map(|(n, v)| Attribute::new(*n, *v)).collect();
        DataObject::from_attributes(attrs, false).into_ref()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_registration_creates_application_node() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core();
        let datastore = crate::datastore::spawn(&dir.path().join("haggle.db"), core.queue().clone())
            .unwrap();
        core.attach_datastore(datastore);

        let mut manager = ApplicationManager::new(core.clone(), 0);
        let addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        manager.handle_control(
            control_object(&[
                (CONTROL_ATTR, CONTROL_REGISTRATION_REQUEST),
                (APPLICATION_NAME_ATTR, "demo"),
            ]),
            addr,
        );

        assert_eq!(manager.sessions.len(), 1);
        let session = manager.sessions.get("demo").unwrap();
        assert!(core.node_store().contains(session.node.read().id()));
        assert_eq!(
            session.node.read().interfaces()[0]
                .read()
                .application_port_number(),
            Some(40001)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interest_changes_update_node() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core();
        let datastore = crate::datastore::spawn(&dir.path().join("haggle.db"), core.queue().clone())
            .unwrap();
        core.attach_datastore(datastore);

        let mut manager = ApplicationManager::new(core.clone(), 0);
        let addr: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        manager.handle_control(
            control_object(&[
                (CONTROL_ATTR, CONTROL_REGISTRATION_REQUEST),
                (APPLICATION_NAME_ATTR, "demo"),
            ]),
            addr,
        );
        let session_id = manager.sessions["demo"].session_id.to_string();

        manager.handle_control(
            control_object(&[
                (CONTROL_ATTR, CONTROL_ADD_INTEREST),
                (SESSION_ID_ATTR, &session_id),
                ("Topic", "weather"),
            ]),
            addr,
        );
        {
            let session = &manager.sessions["demo"];
            let node = session.node.read();
            assert!(node.interests().contains("Topic", "weather"));
        }

        manager.handle_control(
            control_object(&[
                (CONTROL_ATTR, CONTROL_REMOVE_INTEREST),
                (SESSION_ID_ATTR, &session_id),
                ("Topic", "weather"),
            ]),
            addr,
        );
        let session = &manager.sessions["demo"];
        assert!(session.node.read().interests().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_control() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core();
        let datastore = crate::datastore::spawn(&dir.path().join("haggle.db"), core.queue().clone())
            .unwrap();
        core.attach_datastore(datastore);

        let mut manager = ApplicationManager::new(core.clone(), 0);
        manager.handle_control(
            control_object(&[(CONTROL_ATTR, CONTROL_SHUTDOWN)]),
            "127.0.0.1:40003".parse().unwrap(),
        );
        assert!(core.queue().is_shutdown());
    }
}
