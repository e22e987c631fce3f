//! Type-keyed dispatch table for business messages.
//!
//! Each [`MessageType`] maps to at most one handler. Messages with no
//! handler go to the fallback if one is set; otherwise they are logged and
//! dropped. Heartbeat types never reach the dispatcher and cannot be
//! registered.
//!
//! # Example
//!
//! ```ignore
//! let mut dispatcher = Dispatcher::new();
//!
//! dispatcher.register(MessageType::BusinessRequest, |ctx: MessageContext, payload: Bytes| async move {
//!     ctx.reply(MessageType::BusinessResponse, payload).await
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use bytes::Bytes;

use super::MessageContext;
use crate::error::Result;
use crate::protocol::MessageType;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle one message's payload.
    fn call(&self, ctx: MessageContext, payload: Bytes) -> BoxFuture<'static, HandlerResult>;
}

/// Adapts an async closure or `async fn` to [`Handler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(MessageContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(MessageContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(MessageContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: MessageContext, payload: Bytes) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(ctx, payload))
    }
}

/// Maps message types to handlers.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<MessageType, Box<dyn Handler>>,
    fallback: Option<Box<dyn Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`, replacing any previous one.
    ///
    /// Heartbeat types are handled by the connection itself; registering
    /// one is ignored with a warning.
    pub fn register<F, Fut>(&mut self, kind: MessageType, handler: F)
    where
        F: Fn(MessageContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_boxed(kind, Box::new(FnHandler::new(handler)));
    }

    /// Register an already boxed handler.
    pub fn register_boxed(&mut self, kind: MessageType, handler: Box<dyn Handler>) {
        if kind.is_heartbeat() {
            tracing::warn!("Ignoring handler for heartbeat type {}", kind);
            return;
        }
        if self.handlers.insert(kind, handler).is_some() {
            tracing::debug!("Replaced handler for {}", kind);
        }
    }

    /// Handler for every type without its own.
    pub fn set_fallback<F, Fut>(&mut self, handler: F)
    where
        F: Fn(MessageContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.fallback = Some(Box::new(FnHandler::new(handler)));
    }

    pub fn has_handler(&self, kind: MessageType) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered types, in tag order.
    pub fn registered_types(&self) -> Vec<MessageType> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|k| k.tag());
        kinds
    }

    /// Start handling one message.
    ///
    /// The returned future owns everything it needs and can be spawned.
    pub fn dispatch(&self, ctx: MessageContext, payload: Bytes) -> BoxFuture<'static, HandlerResult> {
        let kind = ctx.kind();
        if let Some(handler) = self.handlers.get(&kind) {
            return handler.call(ctx, payload);
        }
        if let Some(fallback) = &self.fallback {
            return fallback.call(ctx, payload);
        }

        if kind.is_unknown() {
            tracing::warn!(
                client_id = ?ctx.client_id(),
                "Dropping message of unknown type {} ({} bytes)",
                kind,
                payload.len()
            );
        } else {
            tracing::debug!(
                client_id = ?ctx.client_id(),
                "No handler for {}, dropping {} bytes",
                kind,
                payload.len()
            );
        }
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionConfig};
    use crate::error::WireError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::duplex;

    fn context(kind: MessageType) -> MessageContext {
        let (local, _peer) = duplex(64);
        let (handle, _driver) = Connection::establish(local, None, &ConnectionConfig::default());
        MessageContext::new(handle, kind)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(MessageType::BusinessRequest, |_ctx, _payload| async { Ok(()) });
        dispatcher.register(MessageType::FileToServerRequest, |_ctx, _payload| async { Ok(()) });

        assert!(dispatcher.has_handler(MessageType::BusinessRequest));
        assert!(!dispatcher.has_handler(MessageType::Welcome));
        assert_eq!(
            dispatcher.registered_types(),
            vec![MessageType::BusinessRequest, MessageType::FileToServerRequest]
        );
    }

    #[test]
    fn test_heartbeat_registration_ignored() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(MessageType::HeartbeatRequest, |_ctx, _payload| async { Ok(()) });
        dispatcher.register(MessageType::HeartbeatResponse, |_ctx, _payload| async { Ok(()) });

        assert!(dispatcher.registered_types().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_type() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        {
            let hits = hits.clone();
            dispatcher.register(MessageType::BusinessRequest, move |ctx, payload| {
                let hits = hits.clone();
                async move {
                    assert_eq!(ctx.kind(), MessageType::BusinessRequest);
                    assert_eq!(&payload[..], b"ping");
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        dispatcher
            .dispatch(context(MessageType::BusinessRequest), Bytes::from_static(b"ping"))
            .await
            .unwrap();
        dispatcher
            .dispatch(context(MessageType::BusinessResponse), Bytes::from_static(b"pong"))
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_receives_unknown_types() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        {
            let seen = seen.clone();
            dispatcher.set_fallback(move |ctx, _payload| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(ctx.kind());
                    Ok(())
                }
            });
        }

        dispatcher
            .dispatch(context(MessageType::Unknown(42)), Bytes::new())
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![MessageType::Unknown(42)]);
    }

    #[tokio::test]
    async fn test_unhandled_unknown_type_is_dropped() {
        let dispatcher = Dispatcher::new();
        let result = dispatcher
            .dispatch(context(MessageType::Unknown(200)), Bytes::from_static(b"??"))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(MessageType::BusinessRequest, |_ctx, _payload| async {
            Err(WireError::Handler("rejected".into()))
        });

        let result = dispatcher
            .dispatch(context(MessageType::BusinessRequest), Bytes::new())
            .await;
        assert!(matches!(result, Err(WireError::Handler(_))));
    }
}
