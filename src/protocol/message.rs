//! Message and envelope types.
//!
//! Defines the wire format exchanged between contexts. Every message crossing
//! a context boundary has this shape:
//!
//! ```json
//! {
//!   "type": "SAVE_NOTE",
//!   "payload": { ... },
//!   "success": true,
//!   "error": "description",
//!   "messageId": "uuid"
//! }
//! ```
//!
//! `payload`, `success` and `error` are optional; `messageId` appears only on
//! the persistent channel, where responses are matched to requests by ID.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::MessageId;

// ============================================================================
// MessageType
// ============================================================================

/// Closed enumeration of message types shared by all contexts.
///
/// Wire names use SCREAMING_SNAKE_CASE. Adding a variant here is the only way
/// to introduce a new message type; free-form type strings are rejected at
/// the deserialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Liveness probe.
    Ping,
    /// Query the current authentication state.
    GetAuthState,
    /// Authentication state changed; fanned out to interested features.
    AuthStateChanged,
    /// Translate a single caption word.
    TranslateWord,
    /// Translate a caption selection.
    TranslateSelection,
    /// Persist a note for the current video position.
    SaveNote,
    /// Delete a previously saved note.
    DeleteNote,
    /// A note was added; fanned out to open panels.
    NoteAdded,
    /// Forward a query to the AI assistant.
    AiQuery,
    /// User settings changed.
    SettingsChanged,
    /// A page context finished injecting and is ready for traffic.
    PageReady,
}

impl MessageType {
    /// Returns the wire name of this type.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::GetAuthState => "GET_AUTH_STATE",
            Self::AuthStateChanged => "AUTH_STATE_CHANGED",
            Self::TranslateWord => "TRANSLATE_WORD",
            Self::TranslateSelection => "TRANSLATE_SELECTION",
            Self::SaveNote => "SAVE_NOTE",
            Self::DeleteNote => "DELETE_NOTE",
            Self::NoteAdded => "NOTE_ADDED",
            Self::AiQuery => "AI_QUERY",
            Self::SettingsChanged => "SETTINGS_CHANGED",
            Self::PageReady => "PAGE_READY",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message
// ============================================================================

/// A message exchanged between contexts.
///
/// Owned by the sender until handed to the transport; every cross-context
/// exchange is a serialized copy, never a shared reference. Fields beyond
/// the fixed set are preserved in `extra` so application-level additions
/// survive the round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type from the closed enumeration.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Application payload, already transport-safe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Outcome marker on responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    /// Error description on failed responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Free-form additional fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Creates a bare message of the given type.
    #[inline]
    #[must_use]
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            payload: None,
            success: None,
            error: None,
            extra: Map::new(),
        }
    }

    /// Creates a message carrying a payload.
    #[inline]
    #[must_use]
    pub fn with_payload(kind: MessageType, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(kind)
        }
    }

    /// Creates a successful response.
    #[inline]
    #[must_use]
    pub fn success_reply(kind: MessageType, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            success: Some(true),
            ..Self::new(kind)
        }
    }

    /// Creates a failed response.
    #[inline]
    #[must_use]
    pub fn failure_reply(kind: MessageType, error: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            error: Some(error.into()),
            ..Self::new(kind)
        }
    }

    /// Adds a free-form field.
    #[inline]
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Returns `true` if this is a successful response.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success == Some(true)
    }

    /// Returns `true` if this is a failed response.
    #[inline]
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.success == Some(false) || self.error.is_some()
    }

    /// Returns `true` if this message is a response rather than a request.
    ///
    /// Requests never carry `success` or `error`; responses always carry at
    /// least one of them. The persistent channel relies on this to tell a
    /// stale response apart from a peer-originated request.
    #[inline]
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.success.is_some() || self.error.is_some()
    }

    /// Extracts the payload, converting a failed response into an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handler`] carrying the response's error string.
    pub fn into_result(self) -> Result<Value> {
        if self.is_failure() {
            let message = self.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(Error::handler(message));
        }
        Ok(self.payload.unwrap_or(Value::Null))
    }

    /// Gets a string value from the payload.
    ///
    /// Returns empty string if key not found or not a string.
    #[inline]
    #[must_use]
    pub fn get_str(&self, key: &str) -> &str {
        self.payload
            .as_ref()
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    /// Gets a u64 value from the payload.
    ///
    /// Returns 0 if key not found or not a number.
    #[inline]
    #[must_use]
    pub fn get_u64(&self, key: &str) -> u64 {
        self.payload
            .as_ref()
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_u64())
            .unwrap_or_default()
    }

    /// Gets a boolean value from the payload.
    ///
    /// Returns false if key not found or not a boolean.
    #[inline]
    #[must_use]
    pub fn get_bool(&self, key: &str) -> bool {
        self.payload
            .as_ref()
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_bool())
            .unwrap_or_default()
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A message plus its correlation ID, used only on the persistent channel.
///
/// Created at send time; discarded once the matching response arrives or the
/// request times out. Serde-flattened so the wire shape is the message's own
/// fields with `messageId` alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation ID matching request to response.
    #[serde(rename = "messageId")]
    pub message_id: MessageId,

    /// The carried message.
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Wraps a message with a freshly generated correlation ID.
    #[inline]
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            message_id: MessageId::generate(),
            message,
        }
    }

    /// Creates a reply envelope reusing the request's correlation ID.
    #[inline]
    #[must_use]
    pub fn reply(message_id: MessageId, message: Message) -> Self {
        Self {
            message_id,
            message,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
