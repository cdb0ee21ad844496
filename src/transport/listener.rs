//! Accept side of the persistent channel.
//!
//! The background context binds one localhost endpoint; every page context
//! connects to it. Each accepted connection becomes a
//! [`ChannelTransport`] keyed by a fresh [`TargetId`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             BusListener                 │
//! │             (single port)               │
//! │  ┌─────────────────────────────────┐    │
//! │  │ TargetId=1 → page channel 1     │    │
//! │  │ TargetId=2 → page channel 2     │    │
//! │  │ TargetId=3 → page channel 3     │    │
//! │  └─────────────────────────────────┘    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Closed channels are pruned automatically, so
//! [`TargetDirectory::targets`] enumerates exactly the currently open page
//! contexts, which is the set the broadcast dispatcher fans out to.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::bus::{BroadcastTarget, HandlerRegistry, TargetDirectory};
use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::identifiers::TargetId;
use crate::transport::channel::ChannelTransport;
use crate::transport::wire::WsWire;

// ============================================================================
// Constants
// ============================================================================

/// Default bind address (localhost only).
const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Accept poll interval while checking the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// BusListener
// ============================================================================

/// Accepts page-context connections and tracks their channels.
///
/// Thread-safe; shared between the accept loop, the broadcast dispatcher
/// and the owning context.
pub struct BusListener {
    /// Bound port.
    port: u16,

    /// Live channels by target ID.
    channels: RwLock<FxHashMap<TargetId, ChannelTransport>>,

    /// Registry dispatching requests that arrive from page contexts.
    handlers: Arc<HandlerRegistry>,

    /// Channel tunables applied to every accepted connection.
    config: BusConfig,

    /// Shutdown flag.
    shutdown: AtomicBool,
}

// ============================================================================
// BusListener - Constructor
// ============================================================================

impl BusListener {
    /// Binds to `localhost:0` (random available port) and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(handlers: Arc<HandlerRegistry>, config: BusConfig) -> Result<Arc<Self>> {
        Self::bind_ip_port(DEFAULT_BIND_IP, 0, handlers, config).await
    }

    /// Binds to a specific IP and port (0 for random).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind_ip_port(
        ip: IpAddr,
        port: u16,
        handlers: Arc<HandlerRegistry>,
        config: BusConfig,
    ) -> Result<Arc<Self>> {
        let addr = SocketAddr::new(ip, port);
        let listener = TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        debug!(port = actual_port, "BusListener bound");

        let this = Arc::new(Self {
            port: actual_port,
            channels: RwLock::new(FxHashMap::default()),
            handlers,
            config,
            shutdown: AtomicBool::new(false),
        });

        let accept = Arc::clone(&this);
        tokio::spawn(async move {
            accept.accept_loop(listener).await;
        });

        info!(port = actual_port, "BusListener started");

        Ok(this)
    }
}

// ============================================================================
// BusListener - Public API
// ============================================================================

impl BusListener {
    /// Returns the endpoint URL page contexts connect to.
    ///
    /// Format: `ws://127.0.0.1:{port}`
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the number of open page contexts.
    #[inline]
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Returns the channel for a specific target.
    #[must_use]
    pub fn channel(&self, target_id: TargetId) -> Option<ChannelTransport> {
        self.channels.read().get(&target_id).cloned()
    }

    /// Removes and closes a target's channel.
    pub fn remove(&self, target_id: TargetId) {
        let removed = {
            let mut channels = self.channels.write();
            channels.remove(&target_id)
        };

        if let Some(channel) = removed {
            channel.shutdown();
            debug!(target = %target_id, "Target removed");
        }
    }

    /// Shuts down the listener and every channel.
    pub fn shutdown(&self) {
        info!("BusListener shutting down");

        self.shutdown.store(true, Ordering::SeqCst);

        let channels: Vec<_> = {
            let mut map = self.channels.write();
            map.drain().collect()
        };

        for (target_id, channel) in channels {
            channel.shutdown();
            debug!(target = %target_id, "Channel closed during shutdown");
        }
    }
}

// ============================================================================
// BusListener - Accept Loop
// ============================================================================

impl BusListener {
    /// Background task that accepts new page connections.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("Accept loop shutting down");
                break;
            }

            // Accept with timeout to keep checking the shutdown flag.
            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream, addr).await {
                            warn!(error = %e, ?addr, "Connection handling failed");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    /// Upgrades one incoming connection and registers its channel.
    async fn handle_connection(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        addr: SocketAddr,
    ) -> Result<()> {
        debug!(?addr, "New TCP connection");

        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

        let target_id = TargetId::next();
        let channel = ChannelTransport::new(
            Box::new(WsWire::new(ws_stream)),
            Arc::clone(&self.handlers),
            self.config.channel_timeout,
            self.config.pending_limit,
        );

        {
            let mut channels = self.channels.write();
            channels.insert(target_id, channel.clone());
        }

        info!(target = %target_id, ?addr, "Page context connected");

        // Prune the entry once the channel dies.
        let closed = channel.closed();
        tokio::spawn(async move {
            closed.await;
            self.remove(target_id);
        });

        Ok(())
    }
}

// ============================================================================
// TargetDirectory impl
// ============================================================================

impl TargetDirectory for BusListener {
    fn targets(&self) -> Vec<BroadcastTarget> {
        self.channels
            .read()
            .iter()
            .map(|(id, channel)| BroadcastTarget {
                id: *id,
                transport: Arc::new(channel.clone()),
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::bus::Broadcaster;
    use crate::protocol::{Message, MessageType};
    use crate::transport::wire::{Connector, WsConnector};

    fn test_config() -> BusConfig {
        BusConfig::new().with_channel_timeout(Duration::from_millis(500))
    }

    async fn bind_listener() -> (Arc<BusListener>, Arc<HandlerRegistry>) {
        let handlers = Arc::new(HandlerRegistry::new());
        let listener = BusListener::bind(Arc::clone(&handlers), test_config())
            .await
            .expect("bind");
        (listener, handlers)
    }

    /// Connects a simulated page context to the listener, returning its
    /// client-side channel and handler registry.
    async fn connect_page(listener: &BusListener) -> (ChannelTransport, Arc<HandlerRegistry>) {
        let handlers = Arc::new(HandlerRegistry::new());
        let connector = WsConnector::new(listener.ws_url()).expect("url");
        let wire = connector.connect().await.expect("connect");
        let channel = ChannelTransport::new(
            wire,
            Arc::clone(&handlers),
            Duration::from_millis(500),
            100,
        );
        (channel, handlers)
    }

    /// Polls until the listener sees `count` targets.
    async fn wait_for_targets(listener: &BusListener, count: usize) {
        for _ in 0..100 {
            if listener.target_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "listener never reached {count} targets, has {}",
            listener.target_count()
        );
    }

    #[tokio::test]
    async fn test_bind_random_port() {
        let (listener, _handlers) = bind_listener().await;

        assert!(listener.port() > 0);
        assert!(listener.ws_url().starts_with("ws://127.0.0.1:"));
        assert_eq!(listener.target_count(), 0);

        listener.shutdown();
    }

    #[tokio::test]
    async fn test_page_request_served_by_background_handlers() {
        let (listener, handlers) = bind_listener().await;

        handlers
            .register(MessageType::GetAuthState, |_msg| async {
                Ok(json!({"signedIn": true}))
            })
            .detach();

        let (page, _page_handlers) = connect_page(&listener).await;
        wait_for_targets(&listener, 1).await;

        let reply = page
            .request(Message::new(MessageType::GetAuthState), Duration::from_millis(500))
            .await
            .expect("response");

        assert!(reply.is_success());
        assert!(reply.get_bool("signedIn"));

        listener.shutdown();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_page() {
        let (listener, _handlers) = bind_listener().await;

        let (page_a, handlers_a) = connect_page(&listener).await;
        let (page_b, handlers_b) = connect_page(&listener).await;
        wait_for_targets(&listener, 2).await;

        handlers_a
            .register(MessageType::NoteAdded, |_msg| async { Ok(json!("a")) })
            .detach();
        handlers_b
            .register(MessageType::NoteAdded, |_msg| async { Ok(json!("b")) })
            .detach();

        let broadcaster = Broadcaster::new(Arc::clone(&listener) as Arc<dyn TargetDirectory>);
        let outcome = broadcaster
            .broadcast(Message::new(MessageType::NoteAdded))
            .await;

        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.failed, 0);

        drop(page_a);
        drop(page_b);
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_closed_page_is_pruned() {
        let (listener, _handlers) = bind_listener().await;

        let (page, _page_handlers) = connect_page(&listener).await;
        wait_for_targets(&listener, 1).await;

        page.shutdown();
        wait_for_targets(&listener, 0).await;

        listener.shutdown();
    }

    #[tokio::test]
    async fn test_remove_unknown_target_is_noop() {
        let (listener, _handlers) = bind_listener().await;
        listener.remove(TargetId::next());
        listener.shutdown();
    }
}
