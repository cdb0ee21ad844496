//! Wire protocol for cross-context messaging.
//!
//! This module defines the message shapes that cross every context boundary
//! and the serialization guard that makes arbitrary payloads safe to cross
//! it.
//!
//! # Protocol Overview
//!
//! | Message Type | Channel | Purpose |
//! |--------------|---------|---------|
//! | [`Message`] | one-shot call | Raw request or response |
//! | [`Envelope`] | persistent channel | Message plus correlation ID |
//!
//! A response reuses the request's `type`; outcome is carried by the
//! `success`/`error` fields. On the persistent channel responses are matched
//! to requests purely by `messageId`, never by arrival order.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Message, Envelope and the closed type enumeration |
//! | `sanitize` | Total sanitization of arbitrary payloads |

// ============================================================================
// Submodules
// ============================================================================

/// Message and envelope types.
pub mod message;

/// Serialization guard.
pub mod sanitize;

// ============================================================================
// Re-exports
// ============================================================================

pub use message::{Envelope, Message, MessageType};
pub use sanitize::{sanitize, sanitize_error, sanitize_payload};
