//! Context Bus - Resilient cross-context messaging.
//!
//! This library provides a message bus for browser-extension style runtimes:
//! isolated execution contexts (page-injected scripts, a long-lived
//! background process, transient UI surfaces) that share no memory, can be
//! torn down by the host at any time, and talk over two incompatible
//! delivery primitives.
//!
//! # Architecture
//!
//! Each context owns one [`MessageBus`]. The bus multiplexes any number of
//! concurrent request/response pairs over a persistent duplex channel,
//! falling back to one-shot calls when the channel is down:
//!
//! - Every payload crosses the boundary as a sanitized copy, never a
//!   shared reference
//! - Responses are matched to requests by correlation ID, not arrival order
//! - Channel loss drives a bounded-retry recovery state machine that emits
//!   lifecycle signals, so dependent UI degrades and recovers without
//!   polling
//!
//! # Quick Start
//!
//! ```no_run
//! use context_bus::{Message, MessageBus, MessageType, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // A page context connects to the background's endpoint
//!     let bus = MessageBus::builder()
//!         .endpoint("ws://127.0.0.1:7341")
//!         .build()?;
//!
//!     bus.connect().await?;
//!
//!     // Request/response; falls back to a one-shot call if the
//!     // persistent channel is down
//!     let reply = bus.send(Message::new(MessageType::GetAuthState)).await?;
//!     println!("signed in: {}", reply.get_bool("signedIn"));
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bus`] | [`MessageBus`] facade, handler registry, broadcast |
//! | [`config`] | [`BusConfig`] tunables |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Message shapes and the serialization guard |
//! | [`storage`] | Platform storage abstraction |
//! | [`transport`] | Channels, one-shot calls, connection monitor |
//!
//! # Features
//!
//! - **Isolation**: concurrent sends never cross-wire; each resolves with
//!   the response carrying its own correlation ID
//! - **Total sanitization**: any payload becomes transport-safe; worst case
//!   is field-level information loss, never a failed send
//! - **Bounded recovery**: automatic reconnects with a fixed delay and a
//!   retry budget; terminal failure requires an explicit reset

// ============================================================================
// Modules
// ============================================================================

/// Message bus facade, handler registry and broadcast dispatcher.
pub mod bus;

/// Bus configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for bus entities.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Wire protocol message types and the serialization guard.
pub mod protocol;

/// Platform storage abstraction.
pub mod storage;

/// Transport layer.
///
/// Persistent channel, one-shot fallback, connection monitor and the
/// background accept side.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Bus types
pub use bus::{
    BroadcastOutcome, BroadcastTarget, Broadcaster, BusBuilder, HandlerGuard, HandlerRegistry,
    MessageBus, StaticTargets, TargetDirectory,
};

// Configuration
pub use config::BusConfig;

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{MessageId, TargetId};

// Protocol types
pub use protocol::{Envelope, Message, MessageType, sanitize, sanitize_error, sanitize_payload};

// Storage types
pub use storage::{MemoryStore, RecoveryStore};

// Transport types
pub use transport::{
    BusListener, ChannelTransport, ConnectionMonitor, ConnectionState, Connector, LifecycleEvent,
    LifecycleEvents, OneShotTransport, Transport, Wire, WsConnector,
};
