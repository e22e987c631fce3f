//! Context passed to message handlers.
//!
//! Gives a handler its own connection so it can answer, plus the
//! client id and the type of the message being handled.
//!
//! # Example
//!
//! ```ignore
//! async fn echo(ctx: MessageContext, payload: Bytes) -> HandlerResult {
//!     let text = String::from_utf8_lossy(&payload);
//!     ctx.reply(MessageType::BusinessResponse, format!("Server received: {}", text))
//!         .await
//! }
//! ```

use std::net::SocketAddr;

use bytes::Bytes;

use crate::client_id::ClientId;
use crate::connection::ConnectionHandle;
use crate::error::Result;
use crate::protocol::{Message, MessageType};

/// Per-message handler context.
///
/// Cheap to clone; handlers may move it into spawned tasks and reply later.
#[derive(Clone, Debug)]
pub struct MessageContext {
    connection: ConnectionHandle,
    kind: MessageType,
}

impl MessageContext {
    pub fn new(connection: ConnectionHandle, kind: MessageType) -> Self {
        Self { connection, kind }
    }

    /// Type of the message being handled.
    #[inline]
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    /// Client id of the connection, once known.
    ///
    /// Always present on the server; on the client it is set by the
    /// server's welcome.
    pub fn client_id(&self) -> Option<&ClientId> {
        self.connection.client_id()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.peer_addr()
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Send a message of type `kind` back on the same connection.
    pub async fn reply(&self, kind: MessageType, payload: impl Into<Bytes>) -> Result<()> {
        self.connection.send(Message::new(kind, payload)).await
    }

    /// Send a prepared message back on the same connection.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.connection.send(message).await
    }

    /// Close the connection after handling.
    pub fn close(&self) {
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionConfig};
    use crate::protocol::FrameBuffer;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_reply_goes_to_same_connection() {
        let (local, mut peer) = duplex(4096);
        let (handle, _driver) = Connection::establish(local, None, &ConnectionConfig::default());
        let ctx = MessageContext::new(handle, MessageType::BusinessRequest);

        ctx.reply(MessageType::BusinessResponse, "Server received: ping")
            .await
            .unwrap();

        let mut buf = vec![0u8; 5 + 21];
        peer.read_exact(&mut buf).await.unwrap();
        let messages = FrameBuffer::new().push(&buf).unwrap();
        assert_eq!(messages[0].kind(), MessageType::BusinessResponse);
        assert_eq!(messages[0].payload(), b"Server received: ping");
    }

    #[tokio::test]
    async fn test_context_accessors() {
        let (local, _peer) = duplex(64);
        let (handle, _driver) = Connection::establish(local, None, &ConnectionConfig::default());
        handle.bind_client_id(ClientId::from("client-000000000001"));
        let ctx = MessageContext::new(handle.clone(), MessageType::FileToServerRequest);

        assert_eq!(ctx.kind(), MessageType::FileToServerRequest);
        assert_eq!(ctx.client_id().map(|c| c.as_str()), Some("client-000000000001"));
        assert!(ctx.peer_addr().is_none());

        ctx.close();
        assert!(handle.is_closed());
    }
}
