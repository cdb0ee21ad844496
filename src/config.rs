//! Bus configuration.
//!
//! Provides a type-safe options struct for the tunables of the transport
//! layer and the connection monitor.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use context_bus::BusConfig;
//!
//! let config = BusConfig::new()
//!     .with_channel_timeout(Duration::from_millis(500))
//!     .with_max_reconnect_attempts(3);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// How long a correlated request waits on the persistent channel before the
/// bus falls back to a one-shot call.
const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a one-shot call waits for its direct response.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long channel establishment may take before counting as a failed
/// attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed delay between reconnection attempts.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Consecutive failed reconnects tolerated before the monitor gives up.
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Maximum in-flight correlated requests before new sends are rejected.
const DEFAULT_PENDING_LIMIT: usize = 100;

// ============================================================================
// BusConfig
// ============================================================================

/// Configuration for a [`MessageBus`](crate::MessageBus).
///
/// All fields have working defaults; override only what the deployment
/// needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Timeout for a correlated request on the persistent channel.
    ///
    /// Expiry does not fail the call; it triggers the one-shot fallback.
    pub channel_timeout: Duration,

    /// Timeout for a one-shot call's direct response.
    pub call_timeout: Duration,

    /// Timeout for establishing the persistent channel.
    pub connect_timeout: Duration,

    /// Fixed delay before a scheduled reconnection attempt.
    pub reconnect_delay: Duration,

    /// Bounded retry budget for automatic reconnection.
    ///
    /// Once exceeded the monitor enters a terminal failure state that only
    /// an explicit reset clears.
    pub max_reconnect_attempts: u32,

    /// Cap on simultaneously outstanding correlated requests.
    pub pending_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl BusConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            channel_timeout: DEFAULT_CHANNEL_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl BusConfig {
    /// Sets the persistent-channel request timeout.
    #[inline]
    #[must_use]
    pub const fn with_channel_timeout(mut self, timeout: Duration) -> Self {
        self.channel_timeout = timeout;
        self
    }

    /// Sets the one-shot call timeout.
    #[inline]
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the channel establishment timeout.
    #[inline]
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the fixed reconnection delay.
    #[inline]
    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the reconnection retry budget.
    #[inline]
    #[must_use]
    pub const fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the outstanding-request cap.
    #[inline]
    #[must_use]
    pub const fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
