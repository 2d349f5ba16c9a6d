//! TCP object exchange
//!
//! A sender instance owns a per-peer FIFO queue and transmits sequentially:
//! Object frame (metadata), Accept/Reject from the receiver, payload chunks,
//! final Accept. Receiver instances are spawned per accepted connection and
//! run until peer close or idle timeout. Completion is reported back to the
//! kernel as send-successful / send-failure events.

use crate::event::{Event, EventData, EventType};
use crate::kernel::KernelCore;
use crate::protocol::{ProtocolError, SendItem};
use bytes::BytesMut;
use haggle_core::{DataObject, InterfaceKey};
use haggle_net::framing::{Frame, FrameCodec, FrameType, DATA_CHUNK_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

/// TCP port the object exchange listens on
pub const TCP_DEFAULT_PORT: u16 = 9697;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const FRAME_TIMEOUT: Duration = Duration::from_secs(30);
/// A sender instance with nothing queued exits after this long
const SENDER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How a completed transmission ended
enum SendOutcome {
    Delivered,
    /// The receiver's bloom filter already had the object; convergent with
    /// delivery for bookkeeping purposes
    AlreadyHad,
}

pub async fn write_frame(stream: &mut TcpStream, frame: Frame) -> Result<(), ProtocolError> {
    let mut buf = BytesMut::new();
    FrameCodec::new().encode(frame, &mut buf)?;
    stream.write_all(&buf).await?;
    Ok(())
}

pub async fn read_frame(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<Frame, ProtocolError> {
    let mut codec = FrameCodec::new();
    loop {
        if let Some(frame) = codec.decode(buf)? {
            return Ok(frame);
        }
        let n = tokio::time::timeout(FRAME_TIMEOUT, stream.read_buf(buf))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        if n == 0 {
            return Err(ProtocolError::PeerClosed);
        }
    }
}

/// Sender instance: drains its queue sequentially until cancelled or idle
pub async fn run_sender(
    core: Arc<KernelCore>,
    peer: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<SendItem>,
    mut cancel: watch::Receiver<bool>,
) {
    debug!("tcp sender for {} starting", peer);
    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = cancel.changed() => break,
            _ = tokio::time::sleep(SENDER_IDLE_TIMEOUT) => {
                debug!("tcp sender for {} idle, exiting", peer);
                break;
            }
        };

        match send_object(&item, peer).await {
            Ok(SendOutcome::Delivered) => {
                debug!("sent {} to {}", item.dobj, peer);
                core.post(Event::with_data(
                    EventType::DataObjectSendSuccessful,
                    EventData::DataObjectAndNode(item.dobj, item.target),
                ));
            }
            Ok(SendOutcome::AlreadyHad) => {
                debug!("{} already had {}", peer, item.dobj);
                core.post(Event::with_data(
                    EventType::DataObjectSendSuccessful,
                    EventData::DataObjectAndNode(item.dobj, item.target),
                ));
            }
            Err(e) => {
                warn!("send of {} to {} failed: {}", item.dobj, peer, e);
                core.post(Event::with_data(
                    EventType::DataObjectSendFailure,
                    EventData::DataObjectAndNode(item.dobj, item.target),
                ));
            }
        }
    }

    // Anything still queued becomes a send failure
    while let Ok(item) = rx.try_recv() {
        core.post(Event::with_data(
            EventType::DataObjectSendFailure,
            EventData::DataObjectAndNode(item.dobj, item.target),
        ));
    }
    debug!("tcp sender for {} exiting", peer);
}

async fn send_object(item: &SendItem, peer: SocketAddr) -> Result<SendOutcome, ProtocolError> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
        .await
        .map_err(|_| ProtocolError::Timeout)??;

    let metadata = item.dobj.metadata_bytes()?;
    write_frame(&mut stream, Frame::object(metadata)).await?;

    let mut buf = BytesMut::new();
    match read_frame(&mut stream, &mut buf).await?.frame_type {
        FrameType::Accept => {}
        FrameType::Reject => return Ok(SendOutcome::AlreadyHad),
        other => return Err(ProtocolError::UnexpectedFrame(other)),
    }

    if item.dobj.data_len() > 0 {
        let path = item
            .dobj
            .file_path()
            .ok_or(ProtocolError::MissingPayload)?;
        let mut file = tokio::fs::File::open(path).await?;
        let mut chunk = vec![0u8; DATA_CHUNK_SIZE];
        let mut remaining = item.dobj.data_len();
        while remaining > 0 {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                return Err(ProtocolError::MissingPayload);
            }
            write_frame(&mut stream, Frame::data(chunk[..n].to_vec())).await?;
            remaining = remaining.saturating_sub(n as u64);
        }
        match read_frame(&mut stream, &mut buf).await?.frame_type {
            FrameType::Accept => {}
            FrameType::Reject => return Err(ProtocolError::Rejected),
            other => return Err(ProtocolError::UnexpectedFrame(other)),
        }
    }

    Ok(SendOutcome::Delivered)
}

/// Server instance: accepts connections on a local interface and spawns a
/// receiver per peer
pub fn spawn_server(
    core: Arc<KernelCore>,
    bind: SocketAddr,
    local_iface: InterfaceKey,
    mut cancel: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(bind).await {
            Ok(l) => l,
            Err(e) => {
                warn!("could not bind object exchange on {}: {}", bind, e);
                return;
            }
        };
        info!("object exchange listening on {}", bind);
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("accepted object exchange from {}", peer);
                            let core = core.clone();
                            let iface = local_iface.clone();
                            tokio::spawn(async move {
                                if let Err(e) = run_receiver(core, stream, peer, iface).await {
                                    debug!("receiver for {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => warn!("accept on {}: {}", bind, e),
                    }
                }
                _ = cancel.changed() => break,
            }
        }
        debug!("object exchange server on {} exiting", bind);
    });
}

/// Receiver instance: one inbound object per connection
async fn run_receiver(
    core: Arc<KernelCore>,
    mut stream: TcpStream,
    peer: SocketAddr,
    local_iface: InterfaceKey,
) -> Result<(), ProtocolError> {
    let mut buf = BytesMut::new();
    let frame = read_frame(&mut stream, &mut buf).await?;
    if frame.frame_type != FrameType::Object {
        return Err(ProtocolError::UnexpectedFrame(frame.frame_type));
    }

    let mut dobj = DataObject::from_metadata_bytes(&frame.payload)?;

    let already_have = core.this_node().read().bloomfilter().contains(dobj.id());
    if already_have {
        debug!("rejecting {} from {}: already have it", dobj, peer);
        write_frame(&mut stream, Frame::reject()).await?;
        return Ok(());
    }
    write_frame(&mut stream, Frame::accept()).await?;

    let expected = dobj.data_len();
    let mut verified = false;
    if expected > 0 {
        let file_name = dobj
            .file_name()
            .map(sanitize_file_name)
            .unwrap_or_else(|| "payload.do".to_string());
        let path = core
            .storage_path()
            .join(format!("{}-{}", &dobj.id_str()[..12], file_name));
        let mut file = tokio::fs::File::create(&path).await?;

        let mut received = 0u64;
        while received < expected {
            let frame = read_frame(&mut stream, &mut buf).await?;
            if frame.frame_type != FrameType::Data {
                return Err(ProtocolError::UnexpectedFrame(frame.frame_type));
            }
            file.write_all(&frame.payload).await?;
            received += frame.payload.len() as u64;
        }
        file.flush().await?;
        dobj.attach_payload(path);

        if dobj.data_hash().is_some() {
            if !dobj.verify_payload()? {
                warn!("payload hash mismatch for {} from {}", dobj, peer);
                write_frame(&mut stream, Frame::reject()).await?;
                return Err(ProtocolError::HashMismatch);
            }
            verified = true;
        }
        write_frame(&mut stream, Frame::accept()).await?;
    }

    let dobj = dobj.into_ref();
    dobj.set_received(Some(local_iface));
    info!("received {} from {}", dobj, peer);

    core.post(Event::with_data(
        EventType::DataObjectIncoming,
        EventData::DataObject(dobj.clone()),
    ));
    if verified {
        core.post(Event::with_data(
            EventType::DataObjectVerified,
            EventData::DataObject(dobj.clone()),
        ));
    }
    core.post(Event::with_data(
        EventType::DataObjectReceived,
        EventData::DataObject(dobj),
    ));
    Ok(())
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use haggle_core::{Attribute, AttributeSet, Node};
    use tempfile::tempdir;

    fn test_core(dir: &std::path::Path) -> Arc<KernelCore> {
        let node = Node::this_node("proto-test", &[[2, 0, 0, 0, 4, 1]]).into_ref();
        KernelCore::new(node, dir.to_path_buf())
    }

    fn attrs(pairs: &[(&str, &str)]) -> AttributeSet {
        pairs.iter().map(|(n, v)| Attribute::new(*n, *v)).collect()
    }

    /// Drain the queue until every listed event type was seen, in any
    /// order (sender and receiver complete concurrently)
    async fn collect(core: &Arc<KernelCore>, wanted: &[EventType]) -> Vec<Event> {
        let mut remaining: Vec<EventType> = wanted.to_vec();
        let mut seen = Vec::new();
        while !remaining.is_empty() {
            let ev = tokio::time::timeout(Duration::from_secs(5), core.queue().next())
                .await
                .expect("event in time");
            if let Some(pos) = remaining.iter().position(|t| *t == ev.etype) {
                remaining.remove(pos);
                seen.push(ev);
            }
        }
        seen
    }

    fn find(events: &[Event], etype: EventType) -> &Event {
        events
            .iter()
            .find(|e| e.etype == etype)
            .expect("collected event present")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exchange_metadata_only() {
        let dir = tempdir().unwrap();
        let core = test_core(dir.path());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let iface_key = InterfaceKey {
            kind: haggle_core::InterfaceKind::Ethernet,
            identifier: vec![2, 0, 0, 0, 4, 1],
        };
        spawn_server(core.clone(), addr, iface_key, cancel_rx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let dobj = DataObject::from_attributes(attrs(&[("Topic", "weather")]), true).into_ref();
        let target = Node::this_node("peer", &[[2, 0, 0, 0, 4, 2]]).into_ref();
        let (tx, rx) = mpsc::unbounded_channel();
        let (_sender_cancel, sender_cancel_rx) = watch::channel(false);
        tokio::spawn(run_sender(core.clone(), addr, rx, sender_cancel_rx));
        tx.send(SendItem {
            dobj: dobj.clone(),
            target,
        })
        .unwrap();

        let events = collect(
            &core,
            &[
                EventType::DataObjectReceived,
                EventType::DataObjectSendSuccessful,
            ],
        )
        .await;
        let received = find(&events, EventType::DataObjectReceived);
        assert_eq!(received.data_object().unwrap().id(), dobj.id());
        let success = find(&events, EventType::DataObjectSendSuccessful);
        assert_eq!(success.data_object().unwrap().id(), dobj.id());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exchange_with_payload() {
        let dir = tempdir().unwrap();
        let core = test_core(dir.path());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let iface_key = InterfaceKey {
            kind: haggle_core::InterfaceKind::Ethernet,
            identifier: vec![2, 0, 0, 0, 4, 1],
        };
        spawn_server(core.clone(), addr, iface_key, cancel_rx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let payload = vec![7u8; 200_000];
        let dobj =
            DataObject::from_buffer(dir.path(), &payload, attrs(&[("Topic", "bulk")])).unwrap();
        dobj.set_stored(true);
        let dobj = dobj.into_ref();

        let target = Node::this_node("peer", &[[2, 0, 0, 0, 4, 2]]).into_ref();
        let (tx, rx) = mpsc::unbounded_channel();
        let (_sender_cancel, sender_cancel_rx) = watch::channel(false);
        tokio::spawn(run_sender(core.clone(), addr, rx, sender_cancel_rx));
        tx.send(SendItem {
            dobj: dobj.clone(),
            target,
        })
        .unwrap();

        let events = collect(
            &core,
            &[
                EventType::DataObjectVerified,
                EventType::DataObjectSendSuccessful,
            ],
        )
        .await;
        let verified = find(&events, EventType::DataObjectVerified);
        let received_obj = verified.data_object().unwrap();
        assert_eq!(received_obj.id(), dobj.id());
        assert_eq!(received_obj.data_len(), 200_000);
        assert!(received_obj.verify_payload().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_receiver_rejects_known_object() {
        let dir = tempdir().unwrap();
        let core = test_core(dir.path());

        let dobj = DataObject::from_attributes(attrs(&[("Topic", "known")]), true).into_ref();
        core.this_node().write().bloomfilter_add(dobj.id());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let iface_key = InterfaceKey {
            kind: haggle_core::InterfaceKind::Ethernet,
            identifier: vec![2, 0, 0, 0, 4, 1],
        };
        spawn_server(core.clone(), addr, iface_key, cancel_rx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let target = Node::this_node("peer", &[[2, 0, 0, 0, 4, 2]]).into_ref();
        let (tx, rx) = mpsc::unbounded_channel();
        let (_sender_cancel, sender_cancel_rx) = watch::channel(false);
        tokio::spawn(run_sender(core.clone(), addr, rx, sender_cancel_rx));
        tx.send(SendItem {
            dobj: dobj.clone(),
            target,
        })
        .unwrap();

        // Reject counts as success for convergence; no received event fires
        let events = collect(&core, &[EventType::DataObjectSendSuccessful]).await;
        let success = find(&events, EventType::DataObjectSendSuccessful);
        assert_eq!(success.data_object().unwrap().id(), dobj.id());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(core.queue().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_per_peer_queue_is_fifo() {
        let dir = tempdir().unwrap();
        let core = test_core(dir.path());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let iface_key = InterfaceKey {
            kind: haggle_core::InterfaceKind::Ethernet,
            identifier: vec![2, 0, 0, 0, 4, 1],
        };
        spawn_server(core.clone(), addr, iface_key, cancel_rx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let target = Node::this_node("peer", &[[2, 0, 0, 0, 4, 2]]).into_ref();
        let (tx, rx) = mpsc::unbounded_channel();
        let (_sender_cancel, sender_cancel_rx) = watch::channel(false);
        tokio::spawn(run_sender(core.clone(), addr, rx, sender_cancel_rx));

        let objects: Vec<_> = (0..5)
            .map(|i| {
                DataObject::from_attributes(attrs(&[("Seq", &i.to_string())]), true).into_ref()
            })
            .collect();
        for dobj in &objects {
            tx.send(SendItem {
                dobj: dobj.clone(),
                target: target.clone(),
            })
            .unwrap();
        }

        // Successes come back in enqueue order: the sender transmits its
        // per-peer queue sequentially
        let mut successes = Vec::new();
        while successes.len() < 5 {
            let ev = tokio::time::timeout(Duration::from_secs(5), core.queue().next())
                .await
                .expect("event in time");
            if ev.etype == EventType::DataObjectSendSuccessful {
                successes.push(*ev.data_object().unwrap().id());
            }
        }
        let expected: Vec<_> = objects.iter().map(|d| *d.id()).collect();
        assert_eq!(successes, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queued_items_fail_on_cancel() {
        let dir = tempdir().unwrap();
        let core = test_core(dir.path());
        // Nothing listens here; connects will fail or queue drains on cancel
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(run_sender(core.clone(), addr, rx, cancel_rx));

        let target = Node::this_node("peer", &[[2, 0, 0, 0, 4, 2]]).into_ref();
        for topic in ["a", "b", "c"] {
            tx.send(SendItem {
                dobj: DataObject::from_attributes(attrs(&[("Topic", topic)]), true).into_ref(),
                target: target.clone(),
            })
            .unwrap();
        }
        cancel_tx.send(true).unwrap();

        collect(
            &core,
            &[
                EventType::DataObjectSendFailure,
                EventType::DataObjectSendFailure,
                EventType::DataObjectSendFailure,
            ],
        )
        .await;
    }
}
