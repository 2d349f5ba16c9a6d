//! Application datagram sends
//!
//! Data objects destined for registered applications travel as single
//! metadata datagrams to the client's loopback port; payload objects carry
//! their local file path so the client reads the bytes directly.

use crate::event::{Event, EventData, EventType};
use crate::kernel::KernelCore;
use crate::protocol::SendItem;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Sender instance for one application endpoint
pub async fn run_sender(
    core: Arc<KernelCore>,
    peer: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<SendItem>,
    mut cancel: watch::Receiver<bool>,
) {
    let socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await {
        Ok(s) => s,
        Err(e) => {
            warn!("could not bind application sender socket: {}", e);
            drain_failures(&core, &mut rx);
            return;
        }
    };

    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = cancel.changed() => break,
        };

        let result = match item.dobj.metadata_bytes() {
            Ok(bytes) => socket.send_to(&bytes, peer).await.map(|_| ()),
            Err(e) => Err(std::io::Error::other(e)),
        };
        match result {
            Ok(()) => {
                debug!("delivered {} to application at {}", item.dobj, peer);
                core.post(Event::with_data(
                    EventType::DataObjectSendSuccessful,
                    EventData::DataObjectAndNode(item.dobj, item.target),
                ));
            }
            Err(e) => {
                warn!("application send to {} failed: {}", peer, e);
                core.post(Event::with_data(
                    EventType::DataObjectSendFailure,
                    EventData::DataObjectAndNode(item.dobj, item.target),
                ));
            }
        }
    }
    drain_failures(&core, &mut rx);
}

fn drain_failures(core: &Arc<KernelCore>, rx: &mut mpsc::UnboundedReceiver<SendItem>) {
    while let Ok(item) = rx.try_recv() {
        core.post(Event::with_data(
            EventType::DataObjectSendFailure,
            EventData::DataObjectAndNode(item.dobj, item.target),
        ));
    }
}
