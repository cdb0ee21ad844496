//! One-shot call transport.
//!
//! The fallback delivery primitive: each call establishes a fresh wire,
//! sends the raw message (no correlation ID needed, the exchange owns the whole
//! wire), awaits the single direct response and closes. Slower than the
//! persistent channel but immune to a peer that was just torn down and has
//! not reconnected yet.
//!
//! Every platform-level failure is normalized into a crate [`Error`];
//! a failed connect becomes [`Error::NoReceiver`], the direct analog of the
//! host's "receiving end does not exist".

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::{from_str, to_string};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::transport::{Connector, Transport};

// ============================================================================
// OneShotTransport
// ============================================================================

/// Transport that re-establishes a wire per call.
pub struct OneShotTransport {
    connector: Arc<dyn Connector>,
    call_timeout: Duration,
}

impl OneShotTransport {
    /// Creates a one-shot transport over the given connector.
    #[inline]
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, call_timeout: Duration) -> Self {
        Self {
            connector,
            call_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Transport for OneShotTransport {
    async fn call(&self, message: Message) -> Result<Message> {
        let timeout_ms = self.call_timeout.as_millis() as u64;

        let mut wire = self
            .connector
            .connect()
            .await
            .map_err(|e| Error::no_receiver(e.to_string()))?;

        trace!(kind = %message.kind, "One-shot wire established");

        let json = to_string(&message)?;
        if let Err(e) = wire.send(json).await {
            wire.close().await;
            return Err(e);
        }

        let reply = match timeout(self.call_timeout, wire.recv()).await {
            Ok(Some(Ok(text))) => from_str::<Message>(&text).map_err(Error::from),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => {
                debug!("Peer closed before responding");
                Err(Error::ConnectionClosed)
            }
            Err(_) => Err(Error::timeout("one-shot call", timeout_ms)),
        };

        wire.close().await;
        reply
    }
}

// ============================================================================
// Tests
// ============================================================================
