//! # wirelink
//!
//! Bidirectional TCP messaging with a length-prefixed binary protocol.
//!
//! A [`Server`] accepts many clients, assigns each a [`ClientId`] and keeps
//! them in a [`ConnectionRegistry`] so application code can address a client
//! by id. A [`Client`] keeps one connection to the server alive and
//! reconnects after failures. Both sides run the same heartbeat logic and
//! hand every non-heartbeat message to a type-keyed [`Dispatcher`].
//!
//! ## Wire format
//!
//! ```text
//! ┌──────────────┬────────┬───────────────┐
//! │ length: u32  │ type   │ payload       │
//! │ big endian   │ u8     │ length - 1    │
//! └──────────────┴────────┴───────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use wirelink::{Client, MessageContext, MessageType, Server};
//!
//! #[tokio::main]
//! async fn main() -> wirelink::Result<()> {
//!     let server = Server::builder()
//!         .bind_addr("127.0.0.1:8888")
//!         .handle(MessageType::BusinessRequest, |ctx: MessageContext, payload| async move {
//!             let text = String::from_utf8_lossy(&payload).into_owned();
//!             ctx.reply(MessageType::BusinessResponse, format!("Server received: {}", text))
//!                 .await
//!         })
//!         .bind()
//!         .await?
//!         .spawn();
//!
//!     let client = Client::builder().server_addr("127.0.0.1:8888").start()?;
//!     client.wait_connected(std::time::Duration::from_secs(5)).await?;
//!     client.send("ping").await?;
//!
//!     client.shutdown().await?;
//!     server.shutdown().await
//! }
//! ```

pub mod client_id;
pub mod config;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod transport;

mod backpressure;
mod client;
mod connection;
mod server;
mod writer;

pub use client::{Client, ClientBuilder};
pub use client_id::ClientId;
pub use config::{ClientConfig, ServerConfig};
pub use connection::{Connection, ConnectionConfig, ConnectionDriver, ConnectionHandle, ConnectionId};
pub use error::{Result, WireError};
pub use handler::{Dispatcher, MessageContext};
pub use protocol::{Message, MessageType};
pub use registry::{BroadcastSummary, ConnectionRegistry, DuplicatePolicy, Registration};
pub use server::{Server, ServerBuilder, ServerHandle};
