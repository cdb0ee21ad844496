//! Serialization guard for cross-context payloads.
//!
//! Everything crossing a context boundary is a serialized copy. This module
//! makes that copy total: [`sanitize`] never fails, whatever the input. The
//! worst case is graceful information loss on a single field, replaced by a
//! typed placeholder string; the rest of the value survives intact.
//!
//! Values already transport-safe are returned unchanged, so the guard is
//! idempotent: `sanitize(sanitize(v)) == sanitize(v)`.

// ============================================================================
// Imports
// ============================================================================

use std::error::Error as StdError;

use serde::Serialize;
use serde_json::{Value, json};

// ============================================================================
// Constants
// ============================================================================

/// Maximum nesting depth a payload may have on the wire.
///
/// Kept well below the JSON parser's own recursion limit so a sanitized
/// value always survives a stringify/parse round trip on the receiving side.
const MAX_DEPTH: usize = 64;

/// Placeholder for subtrees cut off at the depth limit.
const DEPTH_PLACEHOLDER: &str = "[unserializable: depth limit exceeded]";

// ============================================================================
// Sanitize
// ============================================================================

/// Rewrites a value into a transport-safe form. Total; never errors.
///
/// Values already within the transport's limits are returned as-is.
/// Otherwise arrays are rewritten element-wise and objects key-wise, with
/// any subtree past the depth limit individually replaced by a placeholder
/// string rather than the whole value being rejected.
#[must_use]
pub fn sanitize(value: &Value) -> Value {
    if is_transport_safe(value) {
        return value.clone();
    }
    rewrite(value, MAX_DEPTH)
}

/// Serializes an arbitrary application value into a transport-safe payload.
///
/// Serialization failure (a map with non-string keys, a custom `Serialize`
/// impl that errors) degrades to a typed placeholder marker, never an error.
#[must_use]
pub fn sanitize_payload<T: Serialize>(payload: &T) -> Value {
    match serde_json::to_value(payload) {
        Ok(value) => sanitize(&value),
        Err(_) => Value::String(format!("[unserializable: {}]", short_type_name::<T>())),
    }
}

/// Converts an error into a transport-safe `{ name, message, stack }` object.
///
/// `stack` renders the error's source chain, one cause per line.
#[must_use]
pub fn sanitize_error<E: StdError>(error: &E) -> Value {
    json!({
        "name": short_type_name::<E>(),
        "message": error.to_string(),
        "stack": render_stack(error),
    })
}

// ============================================================================
// Internals
// ============================================================================

/// Returns `true` if the value survives the transport unchanged.
fn is_transport_safe(value: &Value) -> bool {
    within_depth(value, MAX_DEPTH)
}

fn within_depth(value: &Value, budget: usize) -> bool {
    match value {
        Value::Array(items) => budget > 0 && items.iter().all(|v| within_depth(v, budget - 1)),
        Value::Object(map) => budget > 0 && map.values().all(|v| within_depth(v, budget - 1)),
        _ => true,
    }
}

fn rewrite(value: &Value, budget: usize) -> Value {
    match value {
        Value::Array(items) => {
            if budget == 0 {
                return Value::String(DEPTH_PLACEHOLDER.to_string());
            }
            Value::Array(items.iter().map(|v| rewrite(v, budget - 1)).collect())
        }
        Value::Object(map) => {
            if budget == 0 {
                return Value::String(DEPTH_PLACEHOLDER.to_string());
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), rewrite(v, budget - 1)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

fn render_stack(error: &dyn StdError) -> String {
    let mut stack = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        stack.push_str("\ncaused by: ");
        stack.push_str(&cause.to_string());
        source = cause.source();
    }
    stack
}

/// Last path segment of a type name, e.g. `alloc::string::String` → `String`.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

// ============================================================================
// Tests
// ============================================================================
