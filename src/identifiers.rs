//! Type-safe identifiers for bus entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time:
//!
//! | Type | Backing | Purpose |
//! |------|---------|---------|
//! | [`MessageId`] | UUID v4 | Request/response correlation on the persistent channel |
//! | [`TargetId`] | `u32` | Open page context (broadcast target) |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// MessageId
// ============================================================================

/// Correlation identifier for a request on the persistent channel.
///
/// Generated at send time, attached to the outgoing envelope, and matched
/// against the `messageId` of the eventual response. UUID v4 generation makes
/// collisions between outstanding requests impossible by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generates a new unique message ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// TargetId
// ============================================================================

/// Identifier for an open page context.
///
/// Assigned by the accept side when a page context connects; used by the
/// broadcast dispatcher to enumerate delivery targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(u32);

/// Next target ID to hand out. Starts at 1; 0 is never a valid target.
static NEXT_TARGET_ID: AtomicU32 = AtomicU32::new(1);

impl TargetId {
    /// Creates a target ID from a raw value.
    ///
    /// Returns `None` for 0, which is reserved as invalid.
    #[inline]
    #[must_use]
    pub fn new(value: u32) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    /// Allocates the next process-unique target ID.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_unique() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_message_id_serde_transparent() {
        let id = MessageId::generate();
        let json = serde_json::to_string(&id).expect("serialize");
        // Serializes as a bare string, not a wrapper object
        assert!(json.starts_with('"'));

        let back: MessageId = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, id);
    }

    #[test]
    fn test_target_id_rejects_zero() {
        assert!(TargetId::new(0).is_none());
        assert_eq!(TargetId::new(7).map(|t| t.as_u32()), Some(7));
    }

    #[test]
    fn test_target_id_next_monotonic() {
        let a = TargetId::next();
        let b = TargetId::next();
        assert!(b.as_u32() > a.as_u32());
    }
}
