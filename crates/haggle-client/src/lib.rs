//! Client library for the Haggle daemon
//!
//! Speaks the control vocabulary over the daemon's loopback datagram
//! endpoint. Deliberately synchronous: host applications should not have a
//! runtime imposed on them by their IPC library. Matched data objects and
//! control events arrive as datagrams and are drained with
//! [`Handle::next_event`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use haggle_core::{Attribute, AttributeSet, DataObject, DataObjectId, Timestamp};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default loopback port of the daemon's IPC endpoint
pub const IPC_DEFAULT_PORT: u16 = 8787;

const CONTROL_ATTR: &str = "Control";
const APPLICATION_NAME_ATTR: &str = "ApplicationName";
const SESSION_ID_ATTR: &str = "SessionId";
const DIRECTORY_ATTR: &str = "HaggleDirectory";
const EVENT_ATTR: &str = "Event";
const DATAOBJECT_ID_ATTR: &str = "DataObjectId";

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-visible errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// The daemon is not running or not answering
    #[error("haggle daemon unreachable")]
    DaemonError,
    /// An application with the same name is already registered
    #[error("application name already registered")]
    BusyError,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed reply: {0}")]
    BadReply(String),
    #[error("{0}")]
    Core(#[from] haggle_core::Error),
}

/// Something the daemon pushed to this client
#[derive(Debug)]
pub enum ClientEvent {
    /// A data object matching one of our interests
    DataObject(DataObject),
    /// A numeric control event (shutdown, neighbor update, interest list)
    Control { event_id: u32, attributes: AttributeSet },
}

/// A registered session with the daemon
pub struct Handle {
    socket: UdpSocket,
    daemon: SocketAddr,
    name: String,
    session_id: u32,
    storage_dir: Option<PathBuf>,
}

impl Handle {
    /// Register with the daemon on the default IPC port
    pub fn get(name: &str) -> Result<Handle, ClientError> {
        Self::get_at(
            name,
            SocketAddr::from((Ipv4Addr::LOCALHOST, IPC_DEFAULT_PORT)),
        )
    }

    /// Register with a daemon at a specific endpoint
    pub fn get_at(name: &str, daemon: SocketAddr) -> Result<Handle, ClientError> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
        socket.set_read_timeout(Some(REGISTRATION_TIMEOUT))?;

        let attrs: AttributeSet = [
            Attribute::new(CONTROL_ATTR, "registration_request"),
            Attribute::new(APPLICATION_NAME_ATTR, name),
        ]
        .into_iter()
        .collect();
        let request = DataObject::from_attributes(attrs, false);
        socket
            .send_to(&request.metadata_bytes()?, daemon)
            .map_err(|_| ClientError::DaemonError)?;

        let mut buf = vec![0u8; 64 * 1024];
        let reply = loop {
            let (len, src) = match socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(ClientError::DaemonError)
                }
                Err(e) => return Err(e.into()),
            };
            if src.ip() != daemon.ip() {
                continue;
            }
            break DataObject::from_metadata_bytes(&buf[..len])?;
        };

        let control = reply
            .get_attribute(CONTROL_ATTR)
            .map(|a| a.value().to_string())
            .ok_or_else(|| ClientError::BadReply("no control attribute".into()))?;
        match control.as_str() {
            "registration_reply" => {}
            "registration_reply_registered" => return Err(ClientError::BusyError),
            other => return Err(ClientError::BadReply(format!("unexpected control {other}"))),
        }

        let session_id = reply
            .get_attribute(SESSION_ID_ATTR)
            .and_then(|a| a.value().parse().ok())
            .ok_or_else(|| ClientError::BadReply("no session id".into()))?;
        let storage_dir = reply
            .get_attribute(DIRECTORY_ATTR)
            .map(|a| PathBuf::from(a.value()));

        debug!("registered '{}' with session {}", name, session_id);
        Ok(Handle {
            socket,
            daemon,
            name: name.to_string(),
            session_id,
            storage_dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// The daemon's storage directory, as reported at registration
    pub fn storage_dir(&self) -> Option<&Path> {
        self.storage_dir.as_deref()
    }

    fn send_control(&self, mut attrs: AttributeSet) -> Result<(), ClientError> {
        attrs.add(Attribute::new(SESSION_ID_ATTR, self.session_id.to_string()));
        let dobj = DataObject::from_attributes(attrs, false);
        self.socket.send_to(&dobj.metadata_bytes()?, self.daemon)?;
        Ok(())
    }

    pub fn add_interest(&self, name: &str, value: &str) -> Result<(), ClientError> {
        self.add_interest_weighted(name, value, haggle_core::WEIGHT_DEFAULT)
    }

    pub fn add_interest_weighted(
        &self,
        name: &str,
        value: &str,
        weight: u32,
    ) -> Result<(), ClientError> {
        let attrs: AttributeSet = [
            Attribute::new(CONTROL_ATTR, "add_interest"),
            Attribute::with_weight(name, value, weight),
        ]
        .into_iter()
        .collect();
        self.send_control(attrs)
    }

    pub fn remove_interest(&self, name: &str, value: &str) -> Result<(), ClientError> {
        let attrs: AttributeSet = [
            Attribute::new(CONTROL_ATTR, "remove_interest"),
            Attribute::new(name, value),
        ]
        .into_iter()
        .collect();
        self.send_control(attrs)
    }

    /// Ask for the current interest list; the reply arrives as a control
    /// event with the interest attributes
    pub fn get_interests(&self) -> Result<(), ClientError> {
        let attrs: AttributeSet = [Attribute::new(CONTROL_ATTR, "get_interests")]
            .into_iter()
            .collect();
        self.send_control(attrs)
    }

    /// Ask for stored data objects matching the current interests; matches
    /// arrive as asynchronous data object events
    pub fn get_data_objects(&self) -> Result<(), ClientError> {
        let attrs: AttributeSet = [Attribute::new(CONTROL_ATTR, "get_dataobjects")]
            .into_iter()
            .collect();
        self.send_control(attrs)
    }

    pub fn register_event_interest(&self, event_id: u32) -> Result<(), ClientError> {
        let attrs: AttributeSet = [
            Attribute::new(CONTROL_ATTR, "register_event_interest"),
            Attribute::new(EVENT_ATTR, event_id.to_string()),
        ]
        .into_iter()
        .collect();
        self.send_control(attrs)
    }

    pub fn delete_data_object(&self, id: &DataObjectId) -> Result<(), ClientError> {
        let attrs: AttributeSet = [
            Attribute::new(CONTROL_ATTR, "delete_dataobject"),
            Attribute::new(DATAOBJECT_ID_ATTR, BASE64.encode(id)),
        ]
        .into_iter()
        .collect();
        self.send_control(attrs)
    }

    /// Publish a data object through the daemon
    pub fn publish(&self, dobj: &DataObject) -> Result<(), ClientError> {
        self.socket.send_to(&dobj.metadata_bytes()?, self.daemon)?;
        Ok(())
    }

    /// Ask the daemon to shut down
    pub fn shutdown_daemon(&self) -> Result<(), ClientError> {
        let attrs: AttributeSet = [Attribute::new(CONTROL_ATTR, "shutdown")]
            .into_iter()
            .collect();
        self.send_control(attrs)
    }

    /// Unregister this session
    pub fn unregister(&self) -> Result<(), ClientError> {
        let attrs: AttributeSet = [
            Attribute::new(CONTROL_ATTR, "deregistration_notice"),
            Attribute::new(APPLICATION_NAME_ATTR, self.name.as_str()),
        ]
        .into_iter()
        .collect();
        self.send_control(attrs)
    }

    /// Wait up to `timeout` for the next pushed event; `None` on timeout
    pub fn next_event(&self, timeout: Duration) -> Result<Option<ClientEvent>, ClientError> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = vec![0u8; 64 * 1024];
        let (len, _) = match self.socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let dobj = DataObject::from_metadata_bytes(&buf[..len])?;

        let is_control_event = dobj
            .get_attribute(CONTROL_ATTR)
            .map(|a| a.value() == "event")
            .unwrap_or(false);
        if is_control_event {
            let event_id = dobj
                .get_attribute(EVENT_ATTR)
                .and_then(|a| a.value().parse().ok())
                .ok_or_else(|| ClientError::BadReply("control event without id".into()))?;
            let attributes = dobj
                .attributes()
                .iter()
                .filter(|a| a.name() != CONTROL_ATTR && a.name() != EVENT_ATTR)
                .cloned()
                .collect();
            Ok(Some(ClientEvent::Control {
                event_id,
                attributes,
            }))
        } else {
            Ok(Some(ClientEvent::DataObject(dobj)))
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let _ = self.unregister();
    }
}

/// Read the daemon's pid file and probe process liveness
pub fn daemon_pid(storage_dir: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(storage_dir.join("haggle.pid")).ok()?;
    let pid: u32 = contents.trim().parse().ok()?;
    if cfg!(target_os = "linux") && !Path::new(&format!("/proc/{pid}")).exists() {
        return None;
    }
    Some(pid)
}

/// Age of a timestamp relative to now, for clients that inspect
/// `create_time` on received objects
pub fn age_of(ts: Timestamp) -> Duration {
    Timestamp::now().saturating_sub(ts)
}
