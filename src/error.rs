//! Error types for the context bus.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use context_bus::{Message, MessageType, Result};
//!
//! async fn example(bus: &context_bus::MessageBus) -> Result<()> {
//!     let reply = bus.send(Message::new(MessageType::Ping)).await?;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::ConnectionClosed`] |
//! | Delivery | [`Error::NoReceiver`], [`Error::RequestTimeout`], [`Error::Timeout`] |
//! | Dispatch | [`Error::NoHandler`], [`Error::Handler`] |
//! | Recovery | [`Error::RetriesExhausted`] |
//! | Protocol | [`Error::Protocol`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::ChannelClosed`] |
//!
//! No platform-level failure is allowed to escape the transport layer as a
//! panic or foreign error type; everything is normalized into one of the
//! variants below.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::MessageId;
use crate::protocol::MessageType;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when bus configuration is invalid or incomplete.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Channel establishment failed.
    ///
    /// Returned when a persistent channel cannot be opened.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Timeout while establishing a connection.
    ///
    /// Returned when the peer context does not accept within the timeout.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Persistent channel closed unexpectedly.
    ///
    /// Returned when the channel is lost mid-operation. Drives the
    /// connection monitor's recovery state machine.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Delivery Errors
    // ========================================================================
    /// No receiver present in the target context.
    ///
    /// The one-shot analog of the platform's "receiving end does not exist":
    /// the target context is open but has no script listening. Expected and
    /// swallowed during broadcast.
    #[error("Receiving end does not exist: {detail}")]
    NoReceiver {
        /// Description of the failed delivery.
        detail: String,
    },

    /// Correlated request timed out on the persistent channel.
    ///
    /// Signals the bus to retry via the one-shot fallback rather than
    /// failing the call outright.
    #[error("Request {message_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The correlation ID that timed out.
        message_id: MessageId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Operation timeout.
    ///
    /// Returned when an operation exceeds its timeout duration.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Dispatch Errors
    // ========================================================================
    /// No handler registered for a message type.
    ///
    /// Terminal for that single request; dispatch reports it as a structured
    /// failure rather than a panic.
    #[error("no handler for {kind}")]
    NoHandler {
        /// The unhandled message type.
        kind: MessageType,
    },

    /// A handler reported a failure.
    #[error("Handler failed: {message}")]
    Handler {
        /// Error message reported by the handler.
        message: String,
    },

    // ========================================================================
    // Recovery Errors
    // ========================================================================
    /// Reconnect retry budget exhausted.
    ///
    /// Terminal for the channel until an explicit reset clears it.
    #[error("Reconnect retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Number of consecutive failed attempts.
        attempts: u32,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or malformed message.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a no-receiver error.
    #[inline]
    pub fn no_receiver(detail: impl Into<String>) -> Self {
        Self::NoReceiver {
            detail: detail.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(message_id: MessageId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            message_id,
            timeout_ms,
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a no-handler error.
    #[inline]
    pub fn no_handler(kind: MessageType) -> Self {
        Self::NoHandler { kind }
    }

    /// Creates a handler failure error.
    #[inline]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Creates a retries exhausted error.
    #[inline]
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Timeout { .. } | Self::RequestTimeout { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the target context had no receiver.
    #[inline]
    #[must_use]
    pub fn is_no_receiver(&self) -> bool {
        matches!(self, Self::NoReceiver { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry or via the fallback
    /// transport.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::Timeout { .. }
                | Self::RequestTimeout { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
