//! Request registry for the persistent channel.
//!
//! Correlates outgoing requests with their eventual responses. Each
//! outstanding request holds one entry keyed by its [`MessageId`]; exactly
//! one of resolve/reject fires per entry, and the entry is removed the
//! moment it fires. A timed-out entry is removed by the channel so the bus
//! can fall back instead of failing the call.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::MessageId;
use crate::protocol::Message;

// ============================================================================
// PendingRequests
// ============================================================================

/// Map of in-flight correlation IDs to their response channels.
///
/// Bounded: once `limit` requests are outstanding, new registrations are
/// rejected rather than queued.
pub struct PendingRequests {
    entries: Mutex<FxHashMap<MessageId, oneshot::Sender<Result<Message>>>>,
    limit: usize,
}

impl PendingRequests {
    /// Creates an empty registry with the given capacity.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            limit,
        }
    }

    /// Registers a new in-flight request and returns its response channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when the registry is at capacity.
    pub fn register(&self, id: MessageId) -> Result<oneshot::Receiver<Result<Message>>> {
        let mut entries = self.entries.lock();

        if entries.len() >= self.limit {
            warn!(
                pending = entries.len(),
                max = self.limit,
                "Too many pending requests"
            );
            return Err(Error::protocol(format!(
                "Too many pending requests: {}/{}",
                entries.len(),
                self.limit
            )));
        }

        let (tx, rx) = oneshot::channel();
        entries.insert(id, tx);
        Ok(rx)
    }

    /// Resolves or rejects the entry matching `id`, removing it.
    ///
    /// Returns `false` if no entry matched (already completed, timed out,
    /// or never registered).
    pub fn complete(&self, id: MessageId, result: Result<Message>) -> bool {
        let tx = self.entries.lock().remove(&id);

        match tx {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Removes an entry without firing it. Used on timeout.
    pub fn remove(&self, id: MessageId) -> bool {
        let removed = self.entries.lock().remove(&id).is_some();
        if removed {
            debug!(message_id = %id, "Removed timed-out correlation");
        }
        removed
    }

    /// Rejects every outstanding entry with [`Error::ConnectionClosed`].
    ///
    /// Called when the channel's event loop terminates. Returns the number
    /// of entries failed.
    pub fn fail_all(&self) -> usize {
        let pending: Vec<_> = {
            let mut entries = self.entries.lock();
            entries.drain().collect()
        };
        let count = pending.len();

        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(count, "Failed pending requests on shutdown");
        }
        count
    }

    /// Returns the number of outstanding requests.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no requests are outstanding.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[tokio::test]
    async fn test_register_and_complete() {
        let pending = PendingRequests::new(10);
        let id = MessageId::generate();

        let rx = pending.register(id).expect("register");
        assert_eq!(pending.len(), 1);

        let matched = pending.complete(id, Ok(Message::new(MessageType::Ping)));
        assert!(matched);
        assert!(pending.is_empty());

        let result = rx.await.expect("channel open").expect("resolved");
        assert_eq!(result.kind, MessageType::Ping);
    }

    #[test]
    fn test_complete_unknown_id() {
        let pending = PendingRequests::new(10);
        let matched = pending.complete(MessageId::generate(), Err(Error::ConnectionClosed));
        assert!(!matched);
    }

    #[test]
    fn test_complete_fires_exactly_once() {
        let pending = PendingRequests::new(10);
        let id = MessageId::generate();
        let _rx = pending.register(id).expect("register");

        assert!(pending.complete(id, Ok(Message::new(MessageType::Ping))));
        // Entry is gone; a second completion has nothing to fire.
        assert!(!pending.complete(id, Ok(Message::new(MessageType::Ping))));
    }

    #[test]
    fn test_capacity_limit() {
        let pending = PendingRequests::new(2);

        let _a = pending.register(MessageId::generate()).expect("first");
        let _b = pending.register(MessageId::generate()).expect("second");

        let result = pending.register(MessageId::generate());
        assert!(result.is_err());
    }

    #[test]
    fn test_remove_frees_capacity() {
        let pending = PendingRequests::new(1);
        let id = MessageId::generate();

        let _rx = pending.register(id).expect("register");
        assert!(pending.remove(id));
        assert!(!pending.remove(id));

        assert!(pending.register(MessageId::generate()).is_ok());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let pending = PendingRequests::new(10);
        let rx_a = pending.register(MessageId::generate()).expect("register");
        let rx_b = pending.register(MessageId::generate()).expect("register");

        assert_eq!(pending.fail_all(), 2);
        assert!(pending.is_empty());

        for rx in [rx_a, rx_b] {
            let result = rx.await.expect("channel open");
            assert!(matches!(result, Err(Error::ConnectionClosed)));
        }
    }
}
