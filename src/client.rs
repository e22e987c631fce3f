//! Client builder and reconnecting connector.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring handlers
//! and building the client. The [`Client`] keeps exactly one connection to
//! the server alive on a supervising task:
//! 1. Connect (bounded by the connect timeout)
//! 2. Send the optional greeting
//! 3. Drive the connection until it closes
//! 4. Wait the reconnect delay and start over
//!
//! Shutdown interrupts any step, including the connect attempt and the
//! reconnect wait.
//!
//! # Example
//!
//! ```ignore
//! use wirelink::{Client, MessageContext, MessageType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .server_addr("127.0.0.1:8888")
//!         .greeting("Hello from client!")
//!         .handle(MessageType::FileToClientRequest, |ctx: MessageContext, payload| async move {
//!             let text = String::from_utf8_lossy(&payload).into_owned();
//!             ctx.reply(MessageType::FileToClientResponse, format!("Client received: {}", text))
//!                 .await
//!         })
//!         .start()?;
//!
//!     client.wait_connected(std::time::Duration::from_secs(5)).await?;
//!     client.send("ping").await?;
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::client_id::ClientId;
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionHandle};
use crate::error::{Result, WireError};
use crate::handler::{Dispatcher, HandlerResult, MessageContext};
use crate::protocol::{Message, MessageType};
use crate::transport;

/// Builder for configuring and starting a client.
pub struct ClientBuilder {
    config: ClientConfig,
    dispatcher: Dispatcher,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            dispatcher: Dispatcher::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Default: `127.0.0.1:8888`
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server_addr = addr.into();
        self
    }

    /// Default: 5 seconds
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Default: 5 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Write-idle window before a heartbeat probe. Default: 30 seconds
    pub fn writer_idle(mut self, idle: Duration) -> Self {
        self.config.heartbeat.writer_idle = idle;
        self
    }

    /// Unanswered probes tolerated before reconnecting. Default: 3
    pub fn max_missed_heartbeats(mut self, max: u32) -> Self {
        self.config.heartbeat.max_missed = max;
        self
    }

    /// Default: 1 MiB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Default: 16
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Text sent as a `WELCOME` message after every connect.
    pub fn greeting(mut self, greeting: impl Into<String>) -> Self {
        self.config.greeting = Some(greeting.into());
        self
    }

    /// Upper bound on [`Client::shutdown`]. Default: 5 seconds
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

    /// Validate the configuration and start the supervising task.
    ///
    /// Returns immediately; use [`Client::wait_connected`] to wait for the
    /// first connection.
    pub fn start(self) -> Result<Client> {
        self.config.validate()?;

        let (current_tx, current_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_grace = self.config.shutdown_grace;

        let supervisor = tokio::spawn(supervise(
            self.config,
            Arc::new(self.dispatcher),
            current_tx,
            shutdown_rx,
        ));

        Ok(Client {
            current: current_rx,
            shutdown_tx,
            supervisor,
            shutdown_grace,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running client.
///
/// Dropping it stops the supervisor and closes the connection.
pub struct Client {
    current: watch::Receiver<Option<ConnectionHandle>>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.current
            .borrow()
            .as_ref()
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some()
    }

    /// Id the server assigned to the current connection.
    pub fn client_id(&self) -> Option<ClientId> {
        self.connection()?.client_id().cloned()
    }

    /// Wait until a connection is up.
    ///
    /// Returns `NotConnected` if none comes up within `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<ConnectionHandle> {
        let mut current = self.current.clone();
        let wait = current.wait_for(|conn| conn.as_ref().is_some_and(|c| !c.is_closed()));
        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(conn)) => conn.clone().ok_or(WireError::NotConnected),
            Ok(Err(_)) => Err(WireError::Shutdown),
            Err(_) => Err(WireError::NotConnected),
        };
        result
    }

    /// Send `payload` as a `BUSINESS_REQUEST`.
    ///
    /// Fails with `NotConnected` if there is no live connection; `Ok` means
    /// the transport accepted the message.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_message(Message::business_request(payload)).await
    }

    /// Send any message on the current connection.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        let connection = self.connection().ok_or(WireError::NotConnected)?;
        connection.send(message).await
    }

    /// Send without waiting for queue space.
    pub fn try_send(&self, message: Message) -> Result<()> {
        let connection = self.connection().ok_or(WireError::NotConnected)?;
        connection.try_send(message)
    }

    /// Stop reconnecting and close the connection.
    ///
    /// Waits up to the shutdown grace for the supervisor, then aborts it.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        if let Some(conn) = self.current.borrow().as_ref() {
            conn.close();
        }

        let mut supervisor = self.supervisor;
        match tokio::time::timeout(self.shutdown_grace, &mut supervisor).await {
            Ok(joined) => joined.map_err(|e| WireError::Io(std::io::Error::other(e))),
            Err(_) => {
                tracing::warn!("client supervisor did not stop within grace, aborting");
                supervisor.abort();
                Ok(())
            }
        }
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped client counts as shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Reconnect loop: connect, run until closed, back off, repeat.
async fn supervise(
    config: ClientConfig,
    dispatcher: Arc<Dispatcher>,
    current: watch::Sender<Option<ConnectionHandle>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(config.max_concurrent_handlers));
    let conn_config = config.connection_config();
    let addr = config.server_addr.as_str();

    loop {
        let attempt = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            attempt = transport::connect(addr, config.connect_timeout) => attempt,
        };

        match attempt {
            Ok(stream) => {
                if let Err(e) = transport::configure(&stream, config.nodelay) {
                    tracing::warn!("failed to set socket options: {}", e);
                }
                let peer = stream.peer_addr().ok();
                let (handle, driver) = Connection::establish(stream, peer, &conn_config);
                tracing::info!(server = addr, "connected");
                current.send_replace(Some(handle.clone()));

                if let Some(greeting) = &config.greeting {
                    if let Err(e) = handle
                        .send(Message::new(MessageType::Welcome, greeting.clone()))
                        .await
                    {
                        tracing::warn!("failed to send greeting: {}", e);
                    }
                }

                let result = tokio::select! {
                    result = driver.run(dispatcher.clone(), permits.clone()) => result,
                    _ = wait_shutdown(&mut shutdown) => {
                        handle.close();
                        Ok(())
                    }
                };
                current.send_replace(None);

                match result {
                    Ok(()) => tracing::info!(server = addr, "connection closed"),
                    Err(e) => tracing::warn!(server = addr, "connection lost: {}", e),
                }
            }
            Err(e) => tracing::warn!(server = addr, "connect failed: {}", e),
        }

        if *shutdown.borrow() {
            break;
        }
        tracing::info!(server = addr, "reconnecting in {:?}", config.reconnect_delay);
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }

    current.send_replace(None);
    tracing::info!("client stopped");
}
