//! Broadcast dispatcher.
//!
//! Fans one message out to every currently open page context. Each target
//! is attempted independently; a target without a receiver is expected (a
//! page with no injected script) and silently skipped, any other failure is
//! logged and skipped. The broadcast settles only after every attempt has
//! settled.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::identifiers::TargetId;
use crate::protocol::Message;
use crate::transport::Transport;

// ============================================================================
// TargetDirectory
// ============================================================================

/// One reachable page context.
pub struct BroadcastTarget {
    /// The context's identifier.
    pub id: TargetId,
    /// Transport delivering to that context.
    pub transport: Arc<dyn Transport>,
}

/// Enumerates the currently open page contexts.
///
/// Implemented by the accept side
/// ([`BusListener`](crate::transport::BusListener)) over its live channels,
/// and by [`StaticTargets`] for fixed sets.
pub trait TargetDirectory: Send + Sync {
    /// Snapshot of the current targets.
    fn targets(&self) -> Vec<BroadcastTarget>;
}

/// Fixed target set.
#[derive(Default)]
pub struct StaticTargets {
    targets: Vec<BroadcastTarget>,
}

impl StaticTargets {
    /// Creates an empty set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target.
    #[must_use]
    pub fn with_target(mut self, id: TargetId, transport: Arc<dyn Transport>) -> Self {
        self.targets.push(BroadcastTarget { id, transport });
        self
    }
}

impl TargetDirectory for StaticTargets {
    fn targets(&self) -> Vec<BroadcastTarget> {
        self.targets
            .iter()
            .map(|t| BroadcastTarget {
                id: t.id,
                transport: Arc::clone(&t.transport),
            })
            .collect()
    }
}

// ============================================================================
// BroadcastOutcome
// ============================================================================

/// Settled result of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Targets that accepted the message.
    pub delivered: usize,
    /// Targets with no receiver present.
    pub missing: usize,
    /// Targets that failed for any other reason.
    pub failed: usize,
}

impl BroadcastOutcome {
    /// Total number of attempted targets.
    #[inline]
    #[must_use]
    pub const fn attempted(&self) -> usize {
        self.delivered + self.missing + self.failed
    }
}

// ============================================================================
// Broadcaster
// ============================================================================

/// Delivers one message to every open page context.
pub struct Broadcaster {
    directory: Arc<dyn TargetDirectory>,
}

impl Broadcaster {
    /// Creates a broadcaster over a target directory.
    #[inline]
    #[must_use]
    pub fn new(directory: Arc<dyn TargetDirectory>) -> Self {
        Self { directory }
    }

    /// Broadcasts a message, settling once every attempt has settled.
    ///
    /// Never fails as a whole: per-target outcomes are aggregated into the
    /// returned [`BroadcastOutcome`].
    pub async fn broadcast(&self, message: Message) -> BroadcastOutcome {
        let targets = self.directory.targets();

        let attempts = targets.into_iter().map(|target| {
            let message = message.clone();
            async move { (target.id, target.transport.call(message).await) }
        });

        let mut outcome = BroadcastOutcome::default();
        for (id, result) in join_all(attempts).await {
            match result {
                Ok(_) => outcome.delivered += 1,
                Err(e) if e.is_no_receiver() => {
                    debug!(target = %id, "No receiver in target context");
                    outcome.missing += 1;
                }
                Err(e) => {
                    warn!(target = %id, error = %e, "Broadcast delivery failed");
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }
}

// ============================================================================
// Tests
// ============================================================================
