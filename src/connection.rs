//! One live connection: a cloneable handle plus the task that drives it.
//!
//! [`Connection::establish`] splits a byte stream, spawns the writer task and
//! returns a [`ConnectionHandle`] (for sending and closing) and a
//! [`ConnectionDriver`] (to be run on its own task). The driver wires the
//! inbound pipeline:
//!
//! ```text
//! socket ─► FrameBuffer ─► HeartbeatMonitor ─┬─► dispatch worker ─► Dispatcher
//!                                            └─► heartbeat reply ─► writer
//! ```
//!
//! The driver also runs the write-idle probe loop and stops on the first
//! of: peer EOF, framing error, heartbeat timeout, handler failure, writer
//! failure, or [`ConnectionHandle::close`]. The connection is always closed
//! when the driver returns.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::client_id::{parse_welcome, ClientId};
use crate::error::{Result, WireError};
use crate::handler::{Dispatcher, MessageContext};
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor, Inbound};
use crate::protocol::{FrameBuffer, Message, MessageType, DEFAULT_MAX_PAYLOAD_SIZE, TYPE_SIZE};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Decoded messages waiting for the dispatch worker.
const DISPATCH_QUEUE_SIZE: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number, independent of the client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Settings shared by every connection of a server or client.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat: HeartbeatConfig,
    pub writer: WriterConfig,
    /// Largest payload accepted inbound or sent outbound.
    pub max_payload_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            writer: WriterConfig::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

struct Shared {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    client_id: OnceLock<ClientId>,
    writer: WriterHandle,
    close_tx: watch::Sender<bool>,
    heartbeat: HeartbeatMonitor,
    max_payload_size: u32,
}

/// Cloneable handle to a live connection.
///
/// Equality is by connection, not by client id.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Client id bound to this connection, if any yet.
    pub fn client_id(&self) -> Option<&ClientId> {
        self.shared.client_id.get()
    }

    /// Bind a client id. Only the first call has an effect.
    pub(crate) fn bind_client_id(&self, client_id: ClientId) -> bool {
        self.shared.client_id.set(client_id).is_ok()
    }

    /// Consecutive heartbeat probes the peer has not answered.
    pub fn missed_heartbeats(&self) -> u32 {
        self.shared.heartbeat.missed()
    }

    /// Frames queued but not yet written.
    pub fn pending_frames(&self) -> usize {
        self.shared.writer.pending_count()
    }

    /// Queue a message, waiting while the outbound queue is full.
    ///
    /// `Ok` means the writer accepted the frame, not that the peer got it.
    pub async fn send(&self, message: Message) -> Result<()> {
        let frame = self.prepare(&message)?;
        self.shared.writer.send(frame).await
    }

    /// Queue a message without waiting.
    pub fn try_send(&self, message: Message) -> Result<()> {
        let frame = self.prepare(&message)?;
        self.shared.writer.try_send(frame)
    }

    fn prepare(&self, message: &Message) -> Result<OutboundFrame> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        let payload_len = message.payload().len();
        if payload_len > self.shared.max_payload_size as usize {
            return Err(WireError::FrameTooLarge {
                length: (payload_len + TYPE_SIZE) as u64,
                max: self.shared.max_payload_size as u64 + TYPE_SIZE as u64,
            });
        }
        OutboundFrame::from_message(message)
    }

    /// Close the connection. Idempotent; unblocks any pending write.
    pub fn close(&self) {
        self.shared.close_tx.send_if_modified(|closed| {
            let changed = !*closed;
            *closed = true;
            changed
        });
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.close_tx.borrow() || self.shared.writer.is_closed()
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.close_tx.subscribe();
        wait_closed(&mut rx).await;
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("client_id", &self.client_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Entry point for wrapping a byte stream.
pub struct Connection;

impl Connection {
    /// Split `stream`, spawn its writer task and return the handle/driver pair.
    ///
    /// Nothing is read until [`ConnectionDriver::run`] is polled.
    pub fn establish<S>(
        stream: S,
        peer_addr: Option<SocketAddr>,
        config: &ConnectionConfig,
    ) -> (ConnectionHandle, ConnectionDriver<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, write_half) = tokio::io::split(stream);
        let (close_tx, close_rx) = watch::channel(false);
        let activity = Arc::new(Notify::new());

        let (writer, writer_task) =
            spawn_writer_task(write_half, &config.writer, close_rx, activity.clone());

        let handle = ConnectionHandle {
            shared: Arc::new(Shared {
                id: ConnectionId::next(),
                peer_addr,
                client_id: OnceLock::new(),
                writer,
                close_tx,
                heartbeat: HeartbeatMonitor::new(config.heartbeat.clone()),
                max_payload_size: config.max_payload_size,
            }),
        };

        let driver = ConnectionDriver {
            reader,
            writer_task,
            activity,
            frame_buffer: FrameBuffer::with_max_payload(config.max_payload_size),
            handle: handle.clone(),
        };

        (handle, driver)
    }
}

/// Drives one connection's inbound pipeline and heartbeat loop.
pub struct ConnectionDriver<S> {
    reader: ReadHalf<S>,
    writer_task: JoinHandle<Result<()>>,
    activity: Arc<Notify>,
    frame_buffer: FrameBuffer,
    handle: ConnectionHandle,
}

impl<S> ConnectionDriver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Run until the connection ends.
    ///
    /// Business messages are handed to `dispatcher` one at a time in arrival
    /// order; each handler holds a permit from `permits` while it runs, so a
    /// shared semaphore bounds handler concurrency across connections.
    ///
    /// After peer EOF every message already received is still dispatched
    /// before the driver returns; a local close cancels pending dispatch.
    ///
    /// Returns `Ok(())` on a clean close (peer EOF or local close) and the
    /// cause otherwise.
    pub async fn run(self, dispatcher: Arc<Dispatcher>, permits: Arc<Semaphore>) -> Result<()> {
        let ConnectionDriver {
            mut reader,
            mut writer_task,
            activity,
            mut frame_buffer,
            handle,
        } = self;

        let mut close_rx = handle.shared.close_tx.subscribe();
        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_SIZE);

        let inbound = async {
            let worker = dispatch_worker(dispatch_rx, dispatcher, &handle, permits);
            tokio::pin!(worker);
            tokio::select! {
                r = read_loop(&mut reader, &mut frame_buffer, &handle, dispatch_tx) => match r {
                    // Peer EOF: the sender is gone, dispatch what was already received
                    Ok(()) => worker.await,
                    Err(e) => Err(e),
                },
                r = &mut worker => r,
            }
        };

        let result = tokio::select! {
            r = inbound => r,
            r = handle.shared.heartbeat.run_idle_loop(&handle.shared.writer, &activity) => r,
            r = &mut writer_task => match r {
                Ok(written) => written,
                Err(e) => Err(WireError::Io(std::io::Error::other(e))),
            },
            _ = wait_closed(&mut close_rx) => Ok(()),
        };

        handle.close();

        match &result {
            Ok(()) => tracing::debug!(connection = %handle.id(), "connection closed"),
            Err(e) => tracing::debug!(connection = %handle.id(), error = %e, "connection ended"),
        }
        result
    }
}

async fn read_loop<R>(
    reader: &mut R,
    frame_buffer: &mut FrameBuffer,
    handle: &ConnectionHandle,
    dispatch_tx: mpsc::Sender<Message>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()), // Peer closed
            Ok(n) => n,
            Err(e) => return Err(WireError::Io(e)),
        };

        for message in frame_buffer.push(&buf[..n])? {
            match handle.shared.heartbeat.on_inbound(message.kind()) {
                Inbound::Consumed => {}
                Inbound::Reply(reply) => handle.send(reply).await?,
                Inbound::Forward => {
                    if message.kind() == MessageType::Welcome && handle.client_id().is_none() {
                        if let Some(client_id) = parse_welcome(message.payload()) {
                            tracing::info!(client_id = %client_id, "assigned client id");
                            handle.bind_client_id(client_id);
                        }
                    }
                    dispatch_tx
                        .send(message)
                        .await
                        .map_err(|_| WireError::ConnectionClosed)?;
                }
            }
        }
    }
}

/// Runs handlers for one connection strictly in arrival order.
async fn dispatch_worker(
    mut rx: mpsc::Receiver<Message>,
    dispatcher: Arc<Dispatcher>,
    handle: &ConnectionHandle,
    permits: Arc<Semaphore>,
) -> Result<()> {
    while let Some(message) = rx.recv().await {
        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WireError::Shutdown)?;

        let kind = message.kind();
        let ctx = MessageContext::new(handle.clone(), kind);
        let handler = dispatcher.dispatch(ctx, message.into_payload());

        // Spawned so a panicking handler only takes down this connection
        let outcome = tokio::spawn(async move {
            let _permit = permit;
            handler.await
        })
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Handler error for {}: {}", kind, e);
                return Err(e);
            }
            Err(e) => {
                tracing::error!("Handler for {} panicked: {}", kind, e);
                return Err(WireError::Handler(format!("handler for {} panicked", kind)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerResult;
    use crate::protocol::encode_message;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc::UnboundedSender;

    fn quiet_config() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat: HeartbeatConfig {
                writer_idle: Duration::ZERO,
                max_missed: 3,
            },
            ..ConnectionConfig::default()
        }
    }

    fn recording_dispatcher(tx: UnboundedSender<Message>) -> Dispatcher {
        let mut dispatcher = Dispatcher::new();
        dispatcher.set_fallback(move |ctx: MessageContext, payload: Bytes| {
            let tx = tx.clone();
            async move {
                tx.send(Message::new(ctx.kind(), payload))
                    .map_err(|_| WireError::ConnectionClosed)
            }
        });
        dispatcher
    }

    async fn failing_handler(_ctx: MessageContext, _payload: Bytes) -> HandlerResult {
        Err(WireError::Handler("boom".into()))
    }

    async fn panicking_handler(_ctx: MessageContext, _payload: Bytes) -> HandlerResult {
        panic!("handler blew up")
    }

    async fn read_message(peer: &mut DuplexStream, buffer: &mut FrameBuffer) -> Message {
        let mut buf = [0u8; 1024];
        loop {
            let n = peer.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed");
            if let Some(msg) = buffer.push(&buf[..n]).unwrap().into_iter().next() {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_heartbeat_request_answered_not_dispatched() {
        let (local, mut peer) = duplex(4096);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle, driver) = Connection::establish(local, None, &quiet_config());
        let task = tokio::spawn(driver.run(
            Arc::new(recording_dispatcher(tx)),
            Arc::new(Semaphore::new(4)),
        ));

        let mut bytes = encode_message(&Message::heartbeat_request()).unwrap().to_vec();
        bytes.extend_from_slice(&encode_message(&Message::heartbeat_response()).unwrap());
        bytes.extend_from_slice(&encode_message(&Message::business_request("hi")).unwrap());
        peer.write_all(&bytes).await.unwrap();

        let mut buffer = FrameBuffer::new();
        let reply = read_message(&mut peer, &mut buffer).await;
        assert_eq!(reply, Message::heartbeat_response());

        let dispatched = rx.recv().await.unwrap();
        assert_eq!(dispatched, Message::business_request("hi"));

        handle.close();
        task.await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_preserves_order() {
        let (local, mut peer) = duplex(64 * 1024);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle, driver) = Connection::establish(local, None, &quiet_config());
        tokio::spawn(driver.run(
            Arc::new(recording_dispatcher(tx)),
            Arc::new(Semaphore::new(16)),
        ));

        for i in 0..50u32 {
            let msg = Message::business_request(i.to_string());
            peer.write_all(&encode_message(&msg).unwrap()).await.unwrap();
        }

        for i in 0..50u32 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.payload(), i.to_string().as_bytes());
        }
        handle.close();
    }

    #[tokio::test]
    async fn test_welcome_binds_client_id() {
        let (local, mut peer) = duplex(4096);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (handle, driver) = Connection::establish(local, None, &quiet_config());
        tokio::spawn(driver.run(
            Arc::new(recording_dispatcher(tx)),
            Arc::new(Semaphore::new(4)),
        ));

        let id = ClientId::from("client-00000000abcd");
        peer.write_all(&encode_message(&Message::welcome(&id)).unwrap())
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.kind(), MessageType::Welcome);
        assert_eq!(handle.client_id(), Some(&id));
        handle.close();
    }

    #[tokio::test]
    async fn test_framing_error_closes_connection() {
        let (local, mut peer) = duplex(4096);
        let (handle, driver) = Connection::establish(local, None, &quiet_config());
        let task = tokio::spawn(driver.run(Arc::new(Dispatcher::new()), Arc::new(Semaphore::new(1))));

        peer.write_all(&[0, 0, 0, 0, 3]).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(WireError::Protocol(_))));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_handler_error_closes_only_connection() {
        let (local, mut peer) = duplex(4096);
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(MessageType::BusinessRequest, failing_handler);
        let (handle, driver) = Connection::establish(local, None, &quiet_config());
        let task = tokio::spawn(driver.run(Arc::new(dispatcher), Arc::new(Semaphore::new(1))));

        peer.write_all(&encode_message(&Message::business_request("x")).unwrap())
            .await
            .unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(WireError::Handler(_))));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let (local, mut peer) = duplex(4096);
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(MessageType::BusinessRequest, panicking_handler);
        let (_handle, driver) = Connection::establish(local, None, &quiet_config());
        let task = tokio::spawn(driver.run(Arc::new(dispatcher), Arc::new(Semaphore::new(1))));

        peer.write_all(&encode_message(&Message::business_request("x")).unwrap())
            .await
            .unwrap();

        let result = task.await.expect("driver task itself does not panic");
        assert!(matches!(result, Err(WireError::Handler(_))));
    }

    #[tokio::test]
    async fn test_peer_eof_ends_driver() {
        let (local, peer) = duplex(4096);
        let (handle, driver) = Connection::establish(local, None, &quiet_config());
        let task = tokio::spawn(driver.run(Arc::new(Dispatcher::new()), Arc::new(Semaphore::new(1))));

        drop(peer);

        task.await.unwrap().unwrap();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(Message::business_request("late")).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_peer_eof_drains_received_messages() {
        let (local, mut peer) = duplex(4096);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new();
        dispatcher.set_fallback(move |ctx: MessageContext, payload: Bytes| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tx.send(Message::new(ctx.kind(), payload))
                    .map_err(|_| WireError::ConnectionClosed)
            }
        });
        let (handle, driver) = Connection::establish(local, None, &quiet_config());
        let task = tokio::spawn(driver.run(Arc::new(dispatcher), Arc::new(Semaphore::new(1))));

        for i in 0..5u32 {
            let msg = Message::business_request(i.to_string());
            peer.write_all(&encode_message(&msg).unwrap()).await.unwrap();
        }
        drop(peer);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("driver finishes after draining")
            .unwrap()
            .unwrap();

        for i in 0..5u32 {
            let msg = rx.try_recv().expect("message dispatched before driver returned");
            assert_eq!(msg.payload(), i.to_string().as_bytes());
        }
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_observable() {
        let (local, _peer) = duplex(4096);
        let (handle, _driver) = Connection::establish(local, None, &quiet_config());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.closed().await })
        };

        handle.close();
        handle.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_send_rejected_locally() {
        let (local, _peer) = duplex(4096);
        let config = ConnectionConfig {
            max_payload_size: 8,
            ..quiet_config()
        };
        let (handle, _driver) = Connection::establish(local, None, &config);

        let err = handle
            .send(Message::business_request(vec![0u8; 9]))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { length: 10, max: 9 }));
        assert!(!handle.is_closed());
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }
}
