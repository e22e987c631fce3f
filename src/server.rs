//! Server listener.
//!
//! [`ServerBuilder`] collects configuration and handlers, [`Server`] owns
//! the bound listener, and [`ServerHandle`] is what the rest of the
//! application keeps: it addresses clients by id and shuts the server down.
//!
//! For every accepted socket the server:
//! 1. generates a [`ClientId`] and registers the connection,
//! 2. sends the welcome message carrying that id,
//! 3. drives the connection until it ends,
//! 4. removes the registry entry (exactly once, even on panic).
//!
//! # Example
//!
//! ```ignore
//! use wirelink::{MessageContext, MessageType, Server};
//!
//! let server = Server::builder()
//!     .bind_addr("0.0.0.0:8888")
//!     .handle(MessageType::BusinessRequest, |ctx: MessageContext, payload| async move {
//!         let text = String::from_utf8_lossy(&payload).into_owned();
//!         ctx.reply(MessageType::BusinessResponse, format!("Server received: {}", text))
//!             .await
//!     })
//!     .bind()
//!     .await?;
//!
//! let handle = server.spawn();
//! handle.broadcast(MessageType::BusinessResponse, "hello everyone").await;
//! handle.shutdown().await?;
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::client_id::ClientId;
use crate::config::{DuplicatePolicy, ServerConfig};
use crate::connection::{Connection, ConnectionConfig};
use crate::error::{Result, WireError};
use crate::handler::{Dispatcher, HandlerResult, MessageContext};
use crate::protocol::{Message, MessageType};
use crate::registry::{BroadcastSummary, ConnectionRegistry};
use crate::transport;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Builder for configuring and binding a server.
pub struct ServerBuilder {
    config: ServerConfig,
    dispatcher: Dispatcher,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            dispatcher: Dispatcher::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Default: `0.0.0.0:8888`
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// Write-idle window before a heartbeat probe. Default: 4 seconds
    pub fn writer_idle(mut self, idle: Duration) -> Self {
        self.config.heartbeat.writer_idle = idle;
        self
    }

    /// Unanswered probes tolerated before closing. Default: 3
    pub fn max_missed_heartbeats(mut self, max: u32) -> Self {
        self.config.heartbeat.max_missed = max;
        self
    }

    /// Default: 1 MiB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Handlers running at once across all connections. Default: 16
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Default: [`DuplicatePolicy::Reject`]
    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.config.duplicate_policy = policy;
        self
    }

    /// Default: 5 seconds
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Register the handler for one message type.
    pub fn handle<F, Fut>(mut self, kind: MessageType, handler: F) -> Self
    where
        F: Fn(MessageContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.dispatcher.register(kind, handler);
        self
    }

    /// Register the handler for types without their own.
    pub fn fallback<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(MessageContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.dispatcher.set_fallback(handler);
        self
    }

    /// Validate the configuration and bind the listener.
    pub async fn bind(self) -> Result<Server> {
        self.config.validate()?;
        let listener = transport::bind(&self.config.bind_addr, self.config.backlog).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "server listening");

        Ok(Server {
            listener,
            local_addr,
            registry: Arc::new(ConnectionRegistry::new(self.config.duplicate_policy)),
            dispatcher: Arc::new(self.dispatcher),
            config: self.config,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound, not yet accepting server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Start accepting on a background task.
    pub fn spawn(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = self.registry.clone();
        let local_addr = self.local_addr;
        let task = tokio::spawn(self.accept_loop(shutdown_rx));

        ServerHandle {
            registry,
            local_addr,
            shutdown_tx,
            task,
        }
    }

    async fn accept_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        let Server {
            listener,
            config,
            dispatcher,
            registry,
            ..
        } = self;

        let permits = Arc::new(Semaphore::new(config.max_concurrent_handlers));
        let conn_config = config.connection_config();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = wait_shutdown(&mut shutdown_rx) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            conn_config.clone(),
                            config.nodelay,
                            dispatcher.clone(),
                            registry.clone(),
                            permits.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        let closing = registry.close_all();
        tracing::info!(connections = closing, "server shutting down");

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "shutdown grace elapsed, aborting connections"
            );
            connections.shutdown().await;
        }
        tracing::info!("server stopped");
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn_config: ConnectionConfig,
    nodelay: bool,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
    permits: Arc<Semaphore>,
) {
    if let Err(e) = transport::configure(&stream, nodelay) {
        tracing::warn!(peer = %peer, "failed to set socket options: {}", e);
    }

    let (handle, driver) = Connection::establish(stream, Some(peer), &conn_config);
    let client_id = ClientId::generate();
    handle.bind_client_id(client_id.clone());

    let registration = match registry.register(client_id.clone(), handle.clone()) {
        Ok(registration) => registration,
        Err(e) => {
            tracing::warn!(peer = %peer, "rejecting connection: {}", e);
            handle.close();
            return;
        }
    };
    tracing::info!(
        client_id = %client_id,
        peer = %peer,
        connections = registry.count(),
        "client connected"
    );

    let result = match handle.send(Message::welcome(&client_id)).await {
        Ok(()) => driver.run(dispatcher, permits).await,
        Err(e) => Err(e),
    };

    drop(registration);
    match result {
        Ok(()) => tracing::info!(
            client_id = %client_id,
            connections = registry.count(),
            "client disconnected"
        ),
        Err(e) => tracing::warn!(
            client_id = %client_id,
            connections = registry.count(),
            "client connection closed: {}",
            e
        ),
    }
}

/// Handle to a running server.
///
/// Dropping the handle also stops the server, without waiting for its
/// connections; prefer [`shutdown`](Self::shutdown).
pub struct ServerHandle {
    registry: Arc<ConnectionRegistry>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.registry.list_ids()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    /// Send one message to a client.
    ///
    /// # Errors
    ///
    /// `UnknownClient` if the id is not connected, otherwise the send error.
    pub async fn send_to(
        &self,
        client_id: &ClientId,
        kind: MessageType,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.registry
            .send_to(client_id, Message::new(kind, payload))
            .await
    }

    /// Send several messages to one client, in order.
    ///
    /// Stops at the first send failure and returns how many were accepted.
    pub async fn send_sequence<I>(
        &self,
        client_id: &ClientId,
        kind: MessageType,
        payloads: I,
    ) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        let connection = self
            .registry
            .lookup(client_id)
            .ok_or_else(|| WireError::UnknownClient(client_id.clone()))?;

        let mut accepted = 0;
        for payload in payloads {
            if let Err(e) = connection.send(Message::new(kind, payload)).await {
                tracing::warn!(
                    client_id = %client_id,
                    accepted,
                    "sequence interrupted: {}",
                    e
                );
                break;
            }
            accepted += 1;
        }
        Ok(accepted)
    }

    /// Best-effort send to every connected client.
    pub async fn broadcast(&self, kind: MessageType, payload: impl Into<Bytes>) -> BroadcastSummary {
        self.registry.broadcast(Message::new(kind, payload)).await
    }

    /// Stop accepting, close every connection and wait for them to end.
    ///
    /// Bounded by the configured shutdown grace.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        self.task
            .await
            .map_err(|e| WireError::Io(std::io::Error::other(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_message, FrameBuffer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn local_server() -> ServerHandle {
        Server::builder()
            .bind_addr("127.0.0.1:0")
            .handle(MessageType::BusinessRequest, |ctx: MessageContext, payload: Bytes| async move {
                let text = String::from_utf8_lossy(&payload).into_owned();
                ctx.reply(MessageType::BusinessResponse, format!("Server received: {}", text))
                    .await
            })
            .bind()
            .await
            .unwrap()
            .spawn()
    }

    async fn read_one(stream: &mut TcpStream, buffer: &mut FrameBuffer) -> Message {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(msg) = buffer.decode_next().unwrap() {
                return msg;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
            buffer.extend(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_welcome_then_echo() {
        let server = local_server().await;
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buffer = FrameBuffer::new();

        let welcome = read_one(&mut stream, &mut buffer).await;
        assert_eq!(welcome.kind(), MessageType::Welcome);
        let id = crate::client_id::parse_welcome(welcome.payload()).unwrap();
        assert_eq!(server.client_ids(), vec![id]);

        let ping = encode_message(&Message::business_request("ping")).unwrap();
        stream.write_all(&ping).await.unwrap();

        let reply = read_one(&mut stream, &mut buffer).await;
        assert_eq!(reply.kind(), MessageType::BusinessResponse);
        assert_eq!(reply.payload(), b"Server received: ping");

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let server = local_server().await;
        let err = server
            .send_to(&ClientId::from("client-missing"), MessageType::BusinessRequest, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::UnknownClient(_)));

        let err = server
            .send_sequence(&ClientId::from("client-missing"), MessageType::BusinessRequest, ["a", "b"])
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::UnknownClient(_)));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_removes_registration() {
        let server = local_server().await;
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buffer = FrameBuffer::new();
        read_one(&mut stream, &mut buffer).await;
        assert_eq!(server.connection_count(), 1);

        drop(stream);

        tokio::time::timeout(Duration::from_secs(2), async {
            while server.connection_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry entry removed");
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let server = local_server().await;
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buffer = FrameBuffer::new();
        read_one(&mut stream, &mut buffer).await;

        tokio::time::timeout(Duration::from_secs(2), server.shutdown())
            .await
            .expect("shutdown within grace")
            .unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("peer sees close")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_bind() {
        let result = Server::builder()
            .bind_addr("127.0.0.1:0")
            .max_concurrent_handlers(0)
            .bind()
            .await;
        assert!(matches!(result, Err(WireError::Config(_))));
    }
}
