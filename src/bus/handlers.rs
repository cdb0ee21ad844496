//! Handler registry and dispatch.
//!
//! Maps each message type to the local functions that process it. Several
//! handlers may be registered for one type; this is intentional fan-out
//! (e.g. multiple features reacting to the same auth-changed signal).
//!
//! # Aggregation
//!
//! Dispatch invokes every registered handler exactly once, in registration
//! order. The first non-error result becomes the dispatch result; if every
//! handler errors, the last error is reported. Dispatch to a type with no
//! handlers returns a structured failure rather than panicking.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{Message, MessageType};

// ============================================================================
// Types
// ============================================================================

/// Boxed future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

/// A registered handler function.
///
/// Receives a copy of the dispatched message; its return value becomes the
/// response payload. The registry does not interpret payload semantics.
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// One registered handler with its registration ID.
struct HandlerEntry {
    id: u64,
    handler: Handler,
}

// ============================================================================
// HandlerRegistry
// ============================================================================

/// Maps message types to their registered handlers.
///
/// The handler set is mutated only by [`register`](Self::register) and guard
/// removal, never by the dispatch path, which works on a snapshot.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Mutex<FxHashMap<MessageType, Vec<HandlerEntry>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a message type.
    ///
    /// The handler stays registered for the lifetime of the returned guard;
    /// dropping the guard (or calling [`HandlerGuard::unregister`]) removes
    /// it. Use [`HandlerGuard::detach`] to keep it registered permanently.
    pub fn register<F, Fut>(self: &Arc<Self>, kind: MessageType, handler: F) -> HandlerGuard
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |message| handler(message).boxed());

        {
            let mut entries = self.entries.lock();
            entries
                .entry(kind)
                .or_default()
                .push(HandlerEntry { id, handler });
        }

        trace!(%kind, id, "Handler registered");

        HandlerGuard {
            registry: Arc::downgrade(self),
            kind,
            id,
            detached: false,
        }
    }

    /// Returns the number of handlers registered for a type.
    #[inline]
    #[must_use]
    pub fn handler_count(&self, kind: MessageType) -> usize {
        self.entries.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Dispatches a message to every handler registered for its type.
    ///
    /// Never panics: a type with no handlers yields a structured failure
    /// response naming the type.
    pub async fn dispatch(&self, message: Message) -> Message {
        let kind = message.kind;

        let snapshot: Vec<Handler> = {
            let entries = self.entries.lock();
            entries
                .get(&kind)
                .map(|handlers| handlers.iter().map(|e| Arc::clone(&e.handler)).collect())
                .unwrap_or_default()
        };

        if snapshot.is_empty() {
            debug!(%kind, "Dispatch with no registered handler");
            return Message::failure_reply(kind, Error::no_handler(kind).to_string());
        }

        let mut first_ok: Option<Value> = None;
        let mut last_err: Option<Error> = None;

        for handler in snapshot {
            match handler(message.clone()).await {
                Ok(value) => {
                    if first_ok.is_none() {
                        first_ok = Some(value);
                    }
                }
                Err(e) => {
                    warn!(%kind, error = %e, "Handler failed");
                    last_err = Some(e);
                }
            }
        }

        match first_ok {
            Some(value) => Message::success_reply(kind, value),
            None => {
                let error = last_err.map_or_else(|| "handler failed".to_string(), |e| e.to_string());
                Message::failure_reply(kind, error)
            }
        }
    }

    /// Removes a handler by registration ID.
    fn unregister(&self, kind: MessageType, id: u64) {
        let mut entries = self.entries.lock();
        if let Some(handlers) = entries.get_mut(&kind) {
            handlers.retain(|e| e.id != id);
            if handlers.is_empty() {
                entries.remove(&kind);
            }
        }
    }
}

// ============================================================================
// HandlerGuard
// ============================================================================

/// Registration handle returned by [`HandlerRegistry::register`].
///
/// Unregisters the handler on drop unless detached.
pub struct HandlerGuard {
    registry: std::sync::Weak<HandlerRegistry>,
    kind: MessageType,
    id: u64,
    detached: bool,
}

impl HandlerGuard {
    /// Explicitly unregisters the handler.
    pub fn unregister(self) {
        // Drop does the work.
    }

    /// Leaves the handler registered for the registry's lifetime.
    pub fn detach(mut self) {
        self.detached = true;
    }

    /// The message type this guard's handler is registered for.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> MessageType {
        self.kind
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.kind, self.id);
            trace!(kind = %self.kind, id = self.id, "Handler unregistered");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    fn registry() -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry::new())
    }

    #[tokio::test]
    async fn test_dispatch_without_handler_returns_structured_failure() {
        let registry = registry();
        let reply = registry.dispatch(Message::new(MessageType::AiQuery)).await;

        assert!(reply.is_failure());
        let error = reply.error.expect("error string");
        assert!(error.contains("AI_QUERY"));
    }

    #[tokio::test]
    async fn test_single_handler_result() {
        let registry = registry();
        let _guard = registry.register(MessageType::Ping, |_msg| async {
            Ok(json!({"pong": true}))
        });

        let reply = registry.dispatch(Message::new(MessageType::Ping)).await;
        assert!(reply.is_success());
        assert!(reply.get_bool("pong"));
    }

    #[tokio::test]
    async fn test_fan_out_invokes_every_handler_exactly_once() {
        let registry = registry();
        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first_calls);
        let _a = registry.register(MessageType::NoteAdded, move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("first"))
            }
        });

        let counter = Arc::clone(&second_calls);
        let _b = registry.register(MessageType::NoteAdded, move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("second"))
            }
        });

        let reply = registry.dispatch(Message::new(MessageType::NoteAdded)).await;

        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);

        // First non-error result wins.
        assert_eq!(reply.payload, Some(json!("first")));
    }

    #[tokio::test]
    async fn test_first_error_falls_through_to_next_success() {
        let registry = registry();
        let _a = registry.register(MessageType::TranslateWord, |_msg| async {
            Err(Error::handler("cache miss"))
        });
        let _b = registry.register(MessageType::TranslateWord, |_msg| async { Ok(json!("hola")) });

        let reply = registry
            .dispatch(Message::new(MessageType::TranslateWord))
            .await;

        assert!(reply.is_success());
        assert_eq!(reply.payload, Some(json!("hola")));
    }

    #[tokio::test]
    async fn test_all_handlers_error_reports_last() {
        let registry = registry();
        let _a = registry.register(MessageType::SaveNote, |_msg| async {
            Err(Error::handler("disk full"))
        });
        let _b = registry.register(MessageType::SaveNote, |_msg| async {
            Err(Error::handler("quota exceeded"))
        });

        let reply = registry.dispatch(Message::new(MessageType::SaveNote)).await;

        assert!(reply.is_failure());
        assert!(reply.error.expect("error").contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_guard_drop_unregisters() {
        let registry = registry();
        {
            let _guard = registry.register(MessageType::Ping, |_msg| async { Ok(json!(1)) });
            assert_eq!(registry.handler_count(MessageType::Ping), 1);
        }
        assert_eq!(registry.handler_count(MessageType::Ping), 0);
    }

    #[tokio::test]
    async fn test_detach_keeps_handler_registered() {
        let registry = registry();
        registry
            .register(MessageType::Ping, |_msg| async { Ok(json!(1)) })
            .detach();

        assert_eq!(registry.handler_count(MessageType::Ping), 1);

        let reply = registry.dispatch(Message::new(MessageType::Ping)).await;
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn test_explicit_unregister() {
        let registry = registry();
        let guard = registry.register(MessageType::Ping, |_msg| async { Ok(json!(1)) });
        let other = registry.register(MessageType::Ping, |_msg| async { Ok(json!(2)) });

        guard.unregister();
        assert_eq!(registry.handler_count(MessageType::Ping), 1);

        let reply = registry.dispatch(Message::new(MessageType::Ping)).await;
        assert_eq!(reply.payload, Some(json!(2)));

        drop(other);
    }

    #[tokio::test]
    async fn test_handler_receives_payload_copy() {
        let registry = registry();
        let _guard = registry.register(MessageType::TranslateWord, |msg| async move {
            Ok(json!({"echo": msg.get_str("word")}))
        });

        let message = Message::with_payload(MessageType::TranslateWord, json!({"word": "gato"}));
        let reply = registry.dispatch(message).await;

        assert_eq!(reply.get_str("echo"), "gato");
    }
}
