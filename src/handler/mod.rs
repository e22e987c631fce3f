//! Handler module - business message dispatch.
//!
//! Provides:
//! - [`Dispatcher`] - maps message types to handlers
//! - [`MessageContext`] - lets handlers reply on their own connection
//!
//! # Example
//!
//! ```ignore
//! use wirelink::handler::{Dispatcher, MessageContext};
//! use wirelink::protocol::MessageType;
//!
//! let mut dispatcher = Dispatcher::new();
//!
//! dispatcher.register(MessageType::BusinessRequest, |ctx: MessageContext, payload| async move {
//!     let text = String::from_utf8_lossy(&payload).into_owned();
//!     ctx.reply(MessageType::BusinessResponse, format!("Server received: {}", text))
//!         .await
//! });
//! ```

mod context;
mod dispatcher;

pub use context::MessageContext;
pub use dispatcher::{BoxFuture, Dispatcher, FnHandler, Handler, HandlerResult};
