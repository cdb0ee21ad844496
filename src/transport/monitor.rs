//! Connection monitor and recovery.
//!
//! Owns the persistent channel's lifecycle. Nobody else mutates connection
//! state; other components only observe it.
//!
//! # State Machine
//!
//! ```text
//! DISCONNECTED --connect--> CONNECTING --success--> CONNECTED
//!      ^                        |                       |
//!      |        failure (retry scheduled)      unexpected close
//!      +------------------------+-----------------------+
//!
//! attempts >= max  ==>  FAILED (terminal until reset())
//! ```
//!
//! Reconnection uses a fixed delay between attempts and a bounded retry
//! counter. Concurrent reconnect triggers coalesce: while an attempt or a
//! delay timer is outstanding, further triggers are no-ops.
//!
//! Every transition into `CONNECTED` or out of it emits a
//! [`LifecycleEvent`] on a broadcast channel, so dependent features can
//! disable and re-enable themselves without polling. Terminal failure
//! additionally persists a recovery flag through the
//! [`RecoveryStore`](crate::storage::RecoveryStore) so a fully restarted
//! context can tell it went down ungracefully.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bus::HandlerRegistry;
use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::storage::RecoveryStore;
use crate::transport::Connector;
use crate::transport::channel::ChannelTransport;

// ============================================================================
// Constants
// ============================================================================

/// Storage key for the persisted recovery flag.
const RECOVERY_FLAG_KEY: &str = "bus.recovery_needed";

/// Capacity of the lifecycle broadcast channel.
const LIFECYCLE_CHANNEL_CAPACITY: usize = 16;

// ============================================================================
// ConnectionState
// ============================================================================

/// Health of the persistent channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel; a connect attempt may be scheduled.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Channel established and usable.
    Connected,
    /// Retry budget exhausted; only [`ConnectionMonitor::reset`] leaves
    /// this state.
    Failed,
}

// ============================================================================
// LifecycleEvent
// ============================================================================

/// Signal emitted on transport health transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Persistent channel established or re-established.
    Connected,
    /// Persistent channel lost; automatic recovery may follow.
    Disconnected,
    /// Retry budget exhausted; manual intervention required.
    RecoveryFailed,
}

// ============================================================================
// LifecycleEvents
// ============================================================================

/// Subscription handle for lifecycle events.
///
/// Obtained from [`ConnectionMonitor::subscribe`]. A slow subscriber that
/// falls behind skips to the oldest retained event rather than blocking the
/// monitor.
pub struct LifecycleEvents {
    receiver: broadcast::Receiver<LifecycleEvent>,
}

impl LifecycleEvents {
    /// Waits for the next lifecycle event.
    ///
    /// Returns `None` once the monitor is gone.
    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Lifecycle subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ============================================================================
// MonitorInner
// ============================================================================

/// State guarded by a single lock: transitions, the retry counter and the
/// reconnect guard always move together.
struct MonitorInner {
    state: ConnectionState,
    attempts: u32,
    reconnect_pending: bool,
    channel: Option<ChannelTransport>,
}

/// What to do after an unexpected close, decided under the lock.
enum CloseAction {
    Ignore,
    Retry,
    GiveUp,
}

// ============================================================================
// ConnectionMonitor
// ============================================================================

/// Tracks persistent-channel health and drives recovery.
pub struct ConnectionMonitor {
    connector: Arc<dyn Connector>,
    handlers: Arc<HandlerRegistry>,
    store: Arc<dyn RecoveryStore>,
    config: BusConfig,
    inner: Mutex<MonitorInner>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ConnectionMonitor {
    /// Creates a monitor in the `Disconnected` state.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        handlers: Arc<HandlerRegistry>,
        store: Arc<dyn RecoveryStore>,
        config: BusConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);

        Arc::new(Self {
            connector,
            handlers,
            store,
            config,
            inner: Mutex::new(MonitorInner {
                state: ConnectionState::Disconnected,
                attempts: 0,
                reconnect_pending: false,
                channel: None,
            }),
            events,
        })
    }

    /// Returns the current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Returns the consecutive-failure count.
    #[inline]
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    /// Returns the live channel, if connected.
    #[must_use]
    pub fn channel(&self) -> Option<ChannelTransport> {
        let inner = self.inner.lock();
        match inner.state {
            ConnectionState::Connected => inner.channel.clone(),
            _ => None,
        }
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> LifecycleEvents {
        LifecycleEvents {
            receiver: self.events.subscribe(),
        }
    }

    /// Returns `true` if a previous incarnation went down ungracefully.
    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.store.get(RECOVERY_FLAG_KEY).is_some()
    }

    /// Attempts to establish the persistent channel.
    ///
    /// Concurrent calls coalesce: while a connect is in flight this is a
    /// no-op. In the terminal `Failed` state it returns
    /// [`Error::RetriesExhausted`] without attempting anything.
    ///
    /// # Errors
    ///
    /// Returns the connect error for a failed attempt; a retry is already
    /// scheduled when the budget allows one.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Failed => return Err(Error::retries_exhausted(inner.attempts)),
                ConnectionState::Disconnected => inner.state = ConnectionState::Connecting,
            }
        }

        self.try_connect().await
    }

    /// Clears terminal failure and tries to connect again.
    ///
    /// The explicit external trigger required to leave the `Failed` state,
    /// e.g. wired to a manual reload action.
    ///
    /// # Errors
    ///
    /// Returns the connect error if the fresh attempt fails.
    pub async fn reset(self: &Arc<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.attempts = 0;
            if inner.state == ConnectionState::Failed {
                inner.state = ConnectionState::Disconnected;
            }
        }
        self.store.remove(RECOVERY_FLAG_KEY);
        info!("Monitor reset");

        self.connect().await
    }

    /// Closes the channel and stops automatic recovery.
    pub fn shutdown(&self) {
        let channel = {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Disconnected;
            inner.channel.take()
        };

        if let Some(channel) = channel {
            channel.shutdown();
            self.emit(LifecycleEvent::Disconnected);
            debug!("Monitor shut down");
        }
    }

    /// Runs one connect attempt; the caller has already moved the state to
    /// `Connecting`.
    async fn try_connect(self: &Arc<Self>) -> Result<()> {
        debug!("Connecting persistent channel");

        let connect_timeout = self.config.connect_timeout;
        let wire = match tokio::time::timeout(connect_timeout, self.connector.connect()).await {
            Ok(Ok(wire)) => wire,
            Ok(Err(e)) => return self.handle_connect_failure(e),
            Err(_) => {
                let e = Error::connection_timeout(connect_timeout.as_millis() as u64);
                return self.handle_connect_failure(e);
            }
        };

        let channel = ChannelTransport::new(
            wire,
            Arc::clone(&self.handlers),
            self.config.channel_timeout,
            self.config.pending_limit,
        );

        {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::Connected;
            inner.attempts = 0;
            inner.channel = Some(channel.clone());
        }

        self.store.remove(RECOVERY_FLAG_KEY);
        self.emit(LifecycleEvent::Connected);
        info!("Persistent channel connected");

        // Watchdog: fires once when the channel's event loop terminates.
        // Holds only the closed-flag watcher, not the channel itself.
        let monitor = Arc::clone(self);
        let closed = channel.closed();
        tokio::spawn(async move {
            closed.await;
            monitor.on_channel_closed();
        });

        Ok(())
    }

    /// Books a failed attempt and either schedules a retry or gives up.
    fn handle_connect_failure(self: &Arc<Self>, error: Error) -> Result<()> {
        let exhausted = {
            let mut inner = self.inner.lock();
            inner.attempts += 1;
            if inner.attempts >= self.config.max_reconnect_attempts {
                inner.state = ConnectionState::Failed;
                true
            } else {
                inner.state = ConnectionState::Disconnected;
                false
            }
        };

        if exhausted {
            warn!(error = %error, "Reconnect retries exhausted");
            self.store.set(RECOVERY_FLAG_KEY, "true");
            self.emit(LifecycleEvent::RecoveryFailed);
            return Err(Error::retries_exhausted(self.config.max_reconnect_attempts));
        }

        warn!(error = %error, "Channel connect failed; retry scheduled");
        self.emit(LifecycleEvent::Disconnected);
        self.schedule_reconnect();
        Err(error)
    }

    /// Reacts to the watchdog reporting an unexpected close.
    fn on_channel_closed(self: &Arc<Self>) {
        let action = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Connected {
                // Explicit shutdown or an already-replaced channel.
                CloseAction::Ignore
            } else {
                inner.channel = None;
                inner.attempts += 1;
                if inner.attempts >= self.config.max_reconnect_attempts {
                    inner.state = ConnectionState::Failed;
                    CloseAction::GiveUp
                } else {
                    inner.state = ConnectionState::Disconnected;
                    CloseAction::Retry
                }
            }
        };

        match action {
            CloseAction::Ignore => {}
            CloseAction::Retry => {
                warn!("Persistent channel closed unexpectedly");
                self.emit(LifecycleEvent::Disconnected);
                self.schedule_reconnect();
            }
            CloseAction::GiveUp => {
                warn!("Persistent channel closed unexpectedly; retries exhausted");
                self.store.set(RECOVERY_FLAG_KEY, "true");
                self.emit(LifecycleEvent::Disconnected);
                self.emit(LifecycleEvent::RecoveryFailed);
            }
        }
    }

    /// Schedules one reconnect after the fixed delay.
    ///
    /// The `reconnect_pending` guard coalesces triggers from independent
    /// call sites into a single outstanding timer.
    fn schedule_reconnect(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.reconnect_pending {
                debug!("Reconnect already scheduled");
                return;
            }
            inner.reconnect_pending = true;
        }

        let monitor = Arc::clone(self);
        let delay = self.config.reconnect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            monitor.inner.lock().reconnect_pending = false;
            let _ = monitor.connect().await;
        });
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ============================================================================
// Tests
// ============================================================================
