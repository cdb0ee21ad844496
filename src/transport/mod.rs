//! Transport layer.
//!
//! The host platform offers two incompatible delivery primitives: a
//! long-lived duplex channel and a one-shot request/response call. Both sit
//! behind the single [`Transport`] trait, so everything above this layer is
//! agnostic to which is active.
//!
//! ```text
//! ┌──────────────┐                                ┌──────────────┐
//! │ Page context │        persistent channel      │  Background  │
//! │              │◄──────────────────────────────►│              │
//! │  Monitor     │      (correlated envelopes)    │  BusListener │
//! │  → Channel   │                                │              │
//! │              │   one-shot call (fallback)     │              │
//! │  OneShot ────┼───────────────────────────────►│              │
//! └──────────────┘                                └──────────────┘
//! ```
//!
//! The persistent channel is cheaper and preserves posting order for bursts
//! of calls; the one-shot path survives a peer that was just torn down and
//! has not reconnected yet. The connection monitor decides which one a send
//! may use.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `wire` | Raw duplex links and connectors |
//! | `pending` | In-flight request registry |
//! | `channel` | Persistent channel transport and event loop |
//! | `oneshot` | One-shot fallback transport |
//! | `monitor` | Connection health, recovery, lifecycle signals |
//! | `listener` | Accept side for the background context |

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::Message;

// ============================================================================
// Submodules
// ============================================================================

/// Persistent channel transport and event loop.
pub mod channel;

/// Accept side for the background context.
pub mod listener;

/// Connection health, recovery and lifecycle signals.
pub mod monitor;

/// One-shot fallback transport.
pub mod oneshot;

/// In-flight request registry.
pub mod pending;

/// Raw duplex links and connectors.
pub mod wire;

// ============================================================================
// Transport
// ============================================================================

/// A delivery primitive: send one message, receive its response.
///
/// Implementations normalize every platform-level failure into a crate
/// [`Error`](crate::Error); no foreign exception escapes a `call`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers a message and awaits its response.
    async fn call(&self, message: Message) -> Result<Message>;
}

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::ChannelTransport;
pub use listener::BusListener;
pub use monitor::{ConnectionMonitor, ConnectionState, LifecycleEvent, LifecycleEvents};
pub use oneshot::OneShotTransport;
pub use pending::PendingRequests;
pub use wire::{Connector, PairWire, Wire, WsConnector, WsWire, pair};
