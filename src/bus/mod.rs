//! Message bus facade.
//!
//! [`MessageBus`] composes the handler registry, the connection monitor and
//! the two transports into the single surface every context uses:
//!
//! - `send`: two-tier delivery, the persistent channel when connected,
//!   the one-shot call as fallback
//! - `register`: attach handlers for inbound message types
//! - `broadcast`: fan a message out to every open page context
//! - `lifecycle`: subscribe to transport health transitions
//!
//! # Example
//!
//! ```ignore
//! use context_bus::{BusConfig, Message, MessageBus, MessageType};
//!
//! # async fn example() -> context_bus::Result<()> {
//! let bus = MessageBus::builder()
//!     .endpoint("ws://127.0.0.1:7341")
//!     .config(BusConfig::new())
//!     .build()?;
//!
//! bus.connect().await?;
//! let reply = bus.send(Message::new(MessageType::GetAuthState)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `handlers` | Handler registry and dispatch |
//! | `broadcast` | Broadcast dispatcher and target directories |

// ============================================================================
// Submodules
// ============================================================================

/// Broadcast dispatcher and target directories.
pub mod broadcast;

/// Handler registry and dispatch.
pub mod handlers;

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::protocol::{Message, MessageType, sanitize};
use crate::storage::{MemoryStore, RecoveryStore};
use crate::transport::{
    ConnectionMonitor, ConnectionState, Connector, LifecycleEvents, OneShotTransport, Transport,
    WsConnector,
};

// ============================================================================
// Re-exports
// ============================================================================

pub use broadcast::{
    BroadcastOutcome, BroadcastTarget, Broadcaster, StaticTargets, TargetDirectory,
};
pub use handlers::{Handler, HandlerFuture, HandlerGuard, HandlerRegistry};

// ============================================================================
// MessageBus
// ============================================================================

/// The per-context messaging facade.
pub struct MessageBus {
    handlers: Arc<HandlerRegistry>,
    monitor: Arc<ConnectionMonitor>,
    fallback: Arc<dyn Transport>,
    broadcaster: Option<Broadcaster>,
    config: BusConfig,
}

impl MessageBus {
    /// Starts building a bus.
    #[inline]
    #[must_use]
    pub fn builder() -> BusBuilder {
        BusBuilder::new()
    }

    /// Returns the handler registry shared with the transports.
    #[inline]
    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Registers a handler for a message type.
    ///
    /// See [`HandlerRegistry::register`].
    pub fn register<F, Fut>(&self, kind: MessageType, handler: F) -> HandlerGuard
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers.register(kind, handler)
    }

    /// Sends a message and awaits its response.
    ///
    /// The payload is passed through the serialization guard, then
    /// delivery is two-tier: if the persistent channel is connected the
    /// message goes out as a correlated envelope with the channel timeout;
    /// on any channel failure (timeout, closed mid-flight) the same
    /// message is retried once through the one-shot fallback. With no
    /// channel at all the fallback is used directly.
    ///
    /// # Errors
    ///
    /// Returns the fallback transport's error when both tiers fail; never
    /// an uncaught platform error.
    pub async fn send(&self, message: Message) -> Result<Message> {
        let message = sanitize_outgoing(message);

        if let Some(channel) = self.monitor.channel() {
            match channel
                .request(message.clone(), self.config.channel_timeout)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    debug!(error = %e, "Channel send failed; falling back to one-shot");
                }
            }
        }

        self.fallback.call(message).await
    }

    /// Broadcasts a message to every open page context.
    ///
    /// Requires a target directory (see [`BusBuilder::targets`]); without
    /// one there is nothing to enumerate and the outcome is empty.
    pub async fn broadcast(&self, message: Message) -> BroadcastOutcome {
        let message = sanitize_outgoing(message);

        match &self.broadcaster {
            Some(broadcaster) => broadcaster.broadcast(message).await,
            None => {
                debug!("Broadcast without a target directory");
                BroadcastOutcome::default()
            }
        }
    }

    /// Establishes the persistent channel.
    ///
    /// # Errors
    ///
    /// See [`ConnectionMonitor::connect`].
    pub async fn connect(&self) -> Result<()> {
        self.monitor.connect().await
    }

    /// Clears terminal failure and reconnects.
    ///
    /// # Errors
    ///
    /// See [`ConnectionMonitor::reset`].
    pub async fn reset(&self) -> Result<()> {
        self.monitor.reset().await
    }

    /// Returns the persistent channel's health.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.monitor.state()
    }

    /// Subscribes to lifecycle events.
    #[inline]
    #[must_use]
    pub fn lifecycle(&self) -> LifecycleEvents {
        self.monitor.subscribe()
    }

    /// Returns `true` if a previous incarnation went down ungracefully.
    #[inline]
    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.monitor.needs_recovery()
    }

    /// Closes the channel and stops automatic recovery.
    pub fn shutdown(&self) {
        self.monitor.shutdown();
    }
}

/// Applies the serialization guard before a message crosses any boundary.
fn sanitize_outgoing(mut message: Message) -> Message {
    if let Some(payload) = message.payload.take() {
        message.payload = Some(sanitize(&payload));
    }
    message
}

// ============================================================================
// BusBuilder
// ============================================================================

/// Builder for a [`MessageBus`].
#[derive(Default)]
pub struct BusBuilder {
    endpoint: Option<String>,
    connector: Option<Arc<dyn Connector>>,
    config: BusConfig,
    store: Option<Arc<dyn RecoveryStore>>,
    directory: Option<Arc<dyn TargetDirectory>>,
}

impl BusBuilder {
    /// Creates a builder with default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            endpoint: None,
            connector: None,
            config: BusConfig::new(),
            store: None,
            directory: None,
        }
    }

    /// Sets the peer endpoint URL (`ws://` or `wss://`).
    #[inline]
    #[must_use]
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    /// Sets a custom connector, overriding [`endpoint`](Self::endpoint).
    #[inline]
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Sets the bus configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the platform storage used for the recovery flag.
    ///
    /// Defaults to an in-memory store.
    #[inline]
    #[must_use]
    pub fn recovery_store(mut self, store: Arc<dyn RecoveryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the target directory enumerating open page contexts.
    ///
    /// Only the background context needs one.
    #[inline]
    #[must_use]
    pub fn targets(mut self, directory: Arc<dyn TargetDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Builds the bus.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if neither a connector nor an endpoint was
    /// given, or [`Error::Protocol`] for a malformed endpoint URL.
    pub fn build(self) -> Result<MessageBus> {
        let connector: Arc<dyn Connector> = match (self.connector, self.endpoint) {
            (Some(connector), _) => connector,
            (None, Some(url)) => Arc::new(WsConnector::new(url)?),
            (None, None) => {
                return Err(Error::config("bus requires a connector or an endpoint"));
            }
        };

        let handlers = Arc::new(HandlerRegistry::new());
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn RecoveryStore>);

        let monitor = ConnectionMonitor::new(
            Arc::clone(&connector),
            Arc::clone(&handlers),
            store,
            self.config.clone(),
        );

        let fallback: Arc<dyn Transport> = Arc::new(OneShotTransport::new(
            connector,
            self.config.call_timeout,
        ));

        let broadcaster = self.directory.map(Broadcaster::new);

        Ok(MessageBus {
            handlers,
            monitor,
            fallback,
            broadcaster,
            config: self.config,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{from_str, json, to_string};
    use tokio::sync::watch;

    use crate::protocol::Envelope;
    use crate::transport::wire::{Wire, pair};
    use crate::transport::{ConnectionState, LifecycleEvent};

    /// Simulated peer context: serves correlated envelopes on persistent
    /// wires and bare messages on one-shot wires, tagging replies with the
    /// path they took. Records every request it sees.
    #[derive(Clone)]
    struct FakePlatform {
        requests: Arc<Mutex<Vec<Message>>>,
        dead_tx: Arc<watch::Sender<bool>>,
    }

    impl FakePlatform {
        fn new() -> Self {
            let (dead_tx, _) = watch::channel(false);
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                dead_tx: Arc::new(dead_tx),
            }
        }

        /// Closes every currently served wire.
        fn kill_live_wires(&self) {
            let _ = self.dead_tx.send(true);
        }

        fn recorded(&self) -> Vec<Message> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl Connector for FakePlatform {
        async fn connect(&self) -> Result<Box<dyn Wire>> {
            let (local, mut remote) = pair();
            let requests = Arc::clone(&self.requests);
            let mut dead_rx = self.dead_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = dead_rx.changed() => {
                            remote.close().await;
                            break;
                        }
                        frame = remote.recv() => {
                            let Some(Ok(text)) = frame else { break };

                            let reply_json = if let Ok(envelope) = from_str::<Envelope>(&text) {
                                requests.lock().push(envelope.message.clone());
                                let reply = Envelope::reply(
                                    envelope.message_id,
                                    Message::success_reply(
                                        envelope.message.kind,
                                        json!({"via": "channel"}),
                                    ),
                                );
                                to_string(&reply)
                            } else if let Ok(message) = from_str::<Message>(&text) {
                                requests.lock().push(message.clone());
                                let reply = Message::success_reply(
                                    message.kind,
                                    json!({"via": "oneshot"}),
                                );
                                to_string(&reply)
                            } else {
                                continue;
                            };

                            let Ok(json) = reply_json else { continue };
                            if remote.send(json).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            Ok(Box::new(local))
        }
    }

    fn bus_with(platform: &FakePlatform, config: BusConfig) -> MessageBus {
        MessageBus::builder()
            .connector(Arc::new(platform.clone()))
            .config(config)
            .build()
            .expect("build")
    }

    fn test_config() -> BusConfig {
        BusConfig::new()
            .with_channel_timeout(Duration::from_millis(200))
            .with_call_timeout(Duration::from_millis(200))
            // Keep automatic recovery out of the way of fallback tests.
            .with_reconnect_delay(Duration::from_secs(60))
    }

    #[test]
    fn test_builder_requires_a_connector() {
        let result = MessageBus::builder().build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_builder_rejects_bad_endpoint() {
        let result = MessageBus::builder().endpoint("ftp://nope").build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_send_uses_channel_when_connected() {
        let platform = FakePlatform::new();
        let bus = bus_with(&platform, test_config());

        bus.connect().await.expect("connect");
        assert_eq!(bus.state(), ConnectionState::Connected);

        let reply = bus.send(Message::new(MessageType::Ping)).await.expect("reply");

        assert!(reply.is_success());
        assert_eq!(reply.get_str("via"), "channel");
    }

    #[tokio::test]
    async fn test_send_without_channel_uses_fallback() {
        let platform = FakePlatform::new();
        let bus = bus_with(&platform, test_config());

        // Never connected: straight to the one-shot path.
        let reply = bus
            .send(Message::new(MessageType::GetAuthState))
            .await
            .expect("reply");

        assert_eq!(reply.get_str("via"), "oneshot");
    }

    #[tokio::test]
    async fn test_send_falls_back_when_channel_dies_mid_flight() {
        let platform = FakePlatform::new();
        let bus = bus_with(&platform, test_config());

        bus.connect().await.expect("connect");
        platform.kill_live_wires();

        // The next send completes via the fallback within one retry bound.
        let reply = bus
            .send(Message::new(MessageType::GetAuthState))
            .await
            .expect("reply");

        assert_eq!(reply.get_str("via"), "oneshot");
    }

    #[tokio::test]
    async fn test_send_sanitizes_payload_before_it_crosses() {
        let platform = FakePlatform::new();
        let bus = bus_with(&platform, test_config());

        // Build a payload nested past the transport depth limit.
        let mut deep = json!("leaf");
        for _ in 0..200 {
            deep = json!([deep]);
        }

        let _ = bus
            .send(Message::with_payload(MessageType::AiQuery, deep.clone()))
            .await
            .expect("reply");

        let seen = platform.recorded();
        assert_eq!(seen.len(), 1);
        let crossed = seen[0].payload.as_ref().expect("payload");
        assert_ne!(crossed, &deep, "payload crossed unguarded");
        assert!(to_string(crossed).is_ok());
    }

    #[tokio::test]
    async fn test_lifecycle_events_via_bus() {
        let platform = FakePlatform::new();
        let bus = bus_with(&platform, test_config());
        let mut events = bus.lifecycle();

        bus.connect().await.expect("connect");
        assert_eq!(events.next().await, Some(LifecycleEvent::Connected));

        platform.kill_live_wires();
        assert_eq!(events.next().await, Some(LifecycleEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_register_serves_peer_requests() {
        // Handlers registered on the bus answer requests arriving over the
        // persistent channel.
        let platform = FakePlatform::new();
        let bus = bus_with(&platform, test_config());

        bus.register(MessageType::SettingsChanged, |_msg| async { Ok(json!({})) })
            .detach();

        assert_eq!(bus.handlers().handler_count(MessageType::SettingsChanged), 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_directory_is_empty() {
        let platform = FakePlatform::new();
        let bus = bus_with(&platform, test_config());

        let outcome = bus.broadcast(Message::new(MessageType::Ping)).await;
        assert_eq!(outcome, BroadcastOutcome::default());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let platform = FakePlatform::new();
        let bus = bus_with(&platform, test_config());

        bus.connect().await.expect("connect");
        bus.shutdown();

        assert_eq!(bus.state(), ConnectionState::Disconnected);
    }
}
