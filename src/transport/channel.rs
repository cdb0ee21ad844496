//! Persistent channel transport and its event loop.
//!
//! One [`ChannelTransport`] owns one [`Wire`](crate::transport::Wire) for
//! its whole lifetime and multiplexes any number of concurrent
//! request/response pairs over it, correlated by
//! [`MessageId`](crate::identifiers::MessageId).
//!
//! # Event Loop
//!
//! The transport spawns a tokio task that handles:
//!
//! - Outgoing correlated envelopes from the local API
//! - Incoming responses, matched against the pending-request registry
//! - Incoming peer-originated requests, dispatched through the local
//!   handler registry with the reply routed back under the same ID
//!
//! The channel preserves sender-side ordering of posted envelopes; responses
//! may arrive in any order and are matched purely by ID. When the loop exits
//! (remote close, wire error, shutdown) every pending request fails with
//! `ConnectionClosed` and a closed flag flips for observers.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{from_str, to_string};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::bus::HandlerRegistry;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, Message};
use crate::transport::pending::PendingRequests;
use crate::transport::{Transport, Wire};

// ============================================================================
// ChannelCommand
// ============================================================================

/// Internal commands for the event loop.
enum ChannelCommand {
    /// Post a correlated request envelope.
    Send(Envelope),
    /// Post a reply to a peer-originated request.
    Reply(Envelope),
    /// Close the wire and stop the loop.
    Shutdown,
}

// ============================================================================
// ChannelTransport
// ============================================================================

/// Persistent-channel transport.
///
/// Cheap to clone; all clones share the same wire, event loop and pending
/// registry.
pub struct ChannelTransport {
    /// Channel to the event loop.
    command_tx: mpsc::UnboundedSender<ChannelCommand>,
    /// In-flight request registry (shared with the event loop).
    pending: Arc<PendingRequests>,
    /// Flips to `true` when the event loop terminates.
    closed_rx: watch::Receiver<bool>,
    /// Timeout applied by [`Transport::call`].
    request_timeout: Duration,
}

impl Clone for ChannelTransport {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            pending: Arc::clone(&self.pending),
            closed_rx: self.closed_rx.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

impl ChannelTransport {
    /// Creates a transport over an established wire.
    ///
    /// Spawns the event loop task internally. Peer-originated requests are
    /// dispatched through `handlers`.
    #[must_use]
    pub fn new(
        wire: Box<dyn Wire>,
        handlers: Arc<HandlerRegistry>,
        request_timeout: Duration,
        pending_limit: usize,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let pending = Arc::new(PendingRequests::new(pending_limit));

        // The loop keeps only a weak sender for routing replies, so
        // dropping every handle closes the command channel and ends the
        // loop.
        tokio::spawn(Self::run_event_loop(
            wire,
            command_rx,
            command_tx.downgrade(),
            Arc::clone(&pending),
            handlers,
            closed_tx,
        ));

        Self {
            command_tx,
            pending,
            closed_rx,
            request_timeout,
        }
    }

    /// Sends a correlated request and waits for its response.
    ///
    /// On timeout the pending entry is removed and [`Error::RequestTimeout`]
    /// is returned so the caller can fall back to a one-shot call; the
    /// request itself is not retried here.
    ///
    /// # Errors
    ///
    /// - [`Error::Protocol`] if too many requests are outstanding
    /// - [`Error::ConnectionClosed`] if the channel died
    /// - [`Error::RequestTimeout`] if no response arrived in time
    pub async fn request(&self, message: Message, request_timeout: Duration) -> Result<Message> {
        let envelope = Envelope::new(message);
        let message_id = envelope.message_id;

        let response_rx = self.pending.register(message_id)?;

        if self.command_tx.send(ChannelCommand::Send(envelope)).is_err() {
            self.pending.remove(message_id);
            return Err(Error::ConnectionClosed);
        }

        match timeout(request_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.pending.remove(message_id);
                Err(Error::request_timeout(
                    message_id,
                    request_timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Returns the number of in-flight requests.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` once the event loop has terminated.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Waits until the event loop terminates.
    pub async fn wait_closed(&self) {
        self.closed().await;
    }

    /// Returns a future resolving when the event loop terminates.
    ///
    /// The future holds only the closed-flag watcher, not the channel
    /// itself, so a watchdog awaiting it does not keep the loop alive.
    /// Used by the connection monitor to detect unexpected closes.
    #[must_use]
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static + use<> {
        let mut closed_rx = self.closed_rx.clone();
        async move {
            while !*closed_rx.borrow() {
                if closed_rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Shuts the channel down gracefully.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(ChannelCommand::Shutdown);
    }

    /// Event loop that owns the wire.
    async fn run_event_loop(
        mut wire: Box<dyn Wire>,
        mut command_rx: mpsc::UnboundedReceiver<ChannelCommand>,
        command_tx: mpsc::WeakUnboundedSender<ChannelCommand>,
        pending: Arc<PendingRequests>,
        handlers: Arc<HandlerRegistry>,
        closed_tx: watch::Sender<bool>,
    ) {
        loop {
            tokio::select! {
                // Inbound frames from the peer context
                frame = wire.recv() => {
                    match frame {
                        Some(Ok(text)) => {
                            Self::handle_frame(&text, &pending, &handlers, &command_tx);
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Wire error");
                            break;
                        }
                        None => {
                            debug!("Wire closed by peer");
                            break;
                        }
                    }
                }

                // Commands from the local API
                command = command_rx.recv() => {
                    match command {
                        Some(ChannelCommand::Send(envelope)) => {
                            Self::post_request(envelope, &mut wire, &pending).await;
                        }

                        Some(ChannelCommand::Reply(envelope)) => {
                            match to_string(&envelope) {
                                Ok(json) => {
                                    if let Err(e) = wire.send(json).await {
                                        warn!(error = %e, "Failed to send reply");
                                    }
                                }
                                Err(e) => warn!(error = %e, "Failed to serialize reply"),
                            }
                        }

                        Some(ChannelCommand::Shutdown) => {
                            debug!("Shutdown command received");
                            wire.close().await;
                            break;
                        }

                        None => {
                            debug!("Command channel closed");
                            break;
                        }
                    }
                }
            }
        }

        // Fail everything still in flight, then flip the closed flag.
        pending.fail_all();
        let _ = closed_tx.send(true);

        debug!("Channel event loop terminated");
    }

    /// Routes one inbound frame.
    fn handle_frame(
        text: &str,
        pending: &Arc<PendingRequests>,
        handlers: &Arc<HandlerRegistry>,
        command_tx: &mpsc::WeakUnboundedSender<ChannelCommand>,
    ) {
        // Correlated envelope: either a response to one of ours or a
        // peer-originated request.
        if let Ok(envelope) = from_str::<Envelope>(text) {
            let Envelope {
                message_id,
                message,
            } = envelope;

            if message.is_reply() {
                if !pending.complete(message_id, Ok(message)) {
                    warn!(%message_id, "Response for unknown request");
                }
                return;
            }

            // Dispatch off-loop; the reply is routed back through the
            // command channel so the loop keeps sole ownership of the wire.
            let handlers = Arc::clone(handlers);
            let command_tx = command_tx.clone();
            tokio::spawn(async move {
                let reply = handlers.dispatch(message).await;
                if let Some(tx) = command_tx.upgrade() {
                    let _ = tx.send(ChannelCommand::Reply(Envelope::reply(message_id, reply)));
                }
            });
            return;
        }

        // Bare message: uncorrelated notification, nothing to send back.
        if let Ok(message) = from_str::<Message>(text) {
            let handlers = Arc::clone(handlers);
            tokio::spawn(async move {
                let _ = handlers.dispatch(message).await;
            });
            return;
        }

        warn!(text = %text, "Failed to parse incoming frame");
    }

    /// Posts a correlated request over the wire.
    async fn post_request(
        envelope: Envelope,
        wire: &mut Box<dyn Wire>,
        pending: &Arc<PendingRequests>,
    ) {
        let message_id = envelope.message_id;

        let json = match to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                pending.complete(message_id, Err(Error::Json(e)));
                return;
            }
        };

        if let Err(e) = wire.send(json).await {
            pending.complete(message_id, Err(Error::connection(e.to_string())));
            return;
        }

        trace!(%message_id, "Request posted");
    }
}

// ============================================================================
// Transport impl
// ============================================================================

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn call(&self, message: Message) -> Result<Message> {
        self.request(message, self.request_timeout).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{Value, json};

    use crate::protocol::MessageType;
    use crate::transport::wire::{PairWire, pair};

    const TEST_TIMEOUT: Duration = Duration::from_millis(200);

    fn channel(wire: PairWire) -> (ChannelTransport, Arc<HandlerRegistry>) {
        let handlers = Arc::new(HandlerRegistry::new());
        let transport =
            ChannelTransport::new(Box::new(wire), Arc::clone(&handlers), TEST_TIMEOUT, 100);
        (transport, handlers)
    }

    /// Serves the peer end of a pair wire: replies to every request
    /// envelope using the provided function.
    fn spawn_peer<F>(mut wire: PairWire, reply_fn: F)
    where
        F: Fn(Envelope) -> Message + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(Ok(text)) = wire.recv().await {
                let envelope: Envelope = from_str(&text).expect("request envelope");
                let reply = Envelope::reply(envelope.message_id, reply_fn(envelope));
                let json = to_string(&reply).expect("serialize");
                if wire.send(json).await.is_err() {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_request_resolves_with_correlated_response() {
        let (local, peer) = pair();
        let (transport, _handlers) = channel(local);

        spawn_peer(peer, |envelope| {
            Message::success_reply(envelope.message.kind, json!({"ok": true}))
        });

        let reply = transport
            .request(Message::new(MessageType::Ping), TEST_TIMEOUT)
            .await
            .expect("response");

        assert!(reply.is_success());
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_by_id_not_order() {
        let (local, mut peer) = pair();
        let (transport, _handlers) = channel(local);

        // Collect three requests, then answer them in reverse order, each
        // echoing its own payload.
        tokio::spawn(async move {
            let mut envelopes = Vec::new();
            for _ in 0..3 {
                let text = peer.recv().await.unwrap().unwrap();
                envelopes.push(from_str::<Envelope>(&text).expect("envelope"));
            }
            for envelope in envelopes.into_iter().rev() {
                let echo = envelope.message.payload.clone().unwrap_or(Value::Null);
                let reply = Envelope::reply(
                    envelope.message_id,
                    Message::success_reply(envelope.message.kind, echo),
                );
                peer.send(to_string(&reply).unwrap()).await.unwrap();
            }
        });

        let calls = (0..3u64).map(|i| {
            let transport = transport.clone();
            async move {
                let message =
                    Message::with_payload(MessageType::TranslateWord, json!({"index": i}));
                let reply = transport.request(message, TEST_TIMEOUT).await.expect("ok");
                (i, reply.get_u64("index"))
            }
        });

        for (sent, echoed) in futures_util::future::join_all(calls).await {
            assert_eq!(sent, echoed, "response crossed wires");
        }
    }

    #[tokio::test]
    async fn test_timeout_cleans_up_pending_entry() {
        let (local, _peer) = pair();
        let (transport, _handlers) = channel(local);

        // Peer never replies.
        let result = transport
            .request(Message::new(MessageType::Ping), Duration::from_millis(50))
            .await;

        assert!(matches!(result, Err(Error::RequestTimeout { .. })));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_fails_in_flight_request() {
        let (local, peer) = pair();
        let (transport, _handlers) = channel(local);

        let in_flight = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .request(Message::new(MessageType::GetAuthState), TEST_TIMEOUT)
                    .await
            })
        };

        // Give the request a chance to be posted, then kill the peer end.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(peer);

        let result = in_flight.await.expect("task");
        assert!(matches!(result, Err(Error::ConnectionClosed)));

        transport.wait_closed().await;
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_peer_originated_request_is_dispatched_and_replied() {
        let (local, mut peer) = pair();
        let (_transport, handlers) = channel(local);

        let _guard = handlers.register(MessageType::SaveNote, |msg| async move {
            Ok(json!({"saved": msg.get_str("text")}))
        });

        let request = Envelope::new(Message::with_payload(
            MessageType::SaveNote,
            json!({"text": "irregular verbs"}),
        ));
        peer.send(to_string(&request).unwrap()).await.unwrap();

        let text = peer.recv().await.unwrap().unwrap();
        let reply: Envelope = from_str(&text).expect("reply envelope");

        assert_eq!(reply.message_id, request.message_id);
        assert!(reply.message.is_success());
        assert_eq!(reply.message.get_str("saved"), "irregular verbs");
    }

    #[tokio::test]
    async fn test_peer_request_without_handler_gets_structured_failure() {
        let (local, mut peer) = pair();
        let (_transport, _handlers) = channel(local);

        let request = Envelope::new(Message::new(MessageType::DeleteNote));
        peer.send(to_string(&request).unwrap()).await.unwrap();

        let text = peer.recv().await.unwrap().unwrap();
        let reply: Envelope = from_str(&text).expect("reply envelope");

        assert!(reply.message.is_failure());
        assert!(reply.message.error.expect("error").contains("DELETE_NOTE"));
    }

    #[tokio::test]
    async fn test_stale_response_is_dropped_not_redispatched() {
        let (local, mut peer) = pair();
        let (transport, _handlers) = channel(local);

        // A response envelope whose id matches nothing we sent.
        let stale = Envelope::new(Message::success_reply(MessageType::Ping, json!({})));
        peer.send(to_string(&stale).unwrap()).await.unwrap();

        // The channel must not bounce anything back for it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.pending_count(), 0);

        // And the channel still works afterwards.
        spawn_peer(peer, |envelope| {
            Message::success_reply(envelope.message.kind, json!({"ok": true}))
        });
        let reply = transport
            .request(Message::new(MessageType::Ping), TEST_TIMEOUT)
            .await
            .expect("response");
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn test_shutdown_terminates_loop() {
        let (local, _peer) = pair();
        let (transport, _handlers) = channel(local);

        transport.shutdown();
        transport.wait_closed().await;

        assert!(transport.is_closed());
        let result = transport
            .request(Message::new(MessageType::Ping), TEST_TIMEOUT)
            .await;
        assert!(result.is_err());
    }
}
