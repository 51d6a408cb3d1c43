//! Broker connection lifecycle.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
//!       any state -> Stopping -> Disconnected
//! ```
//!
//! `Stopping -> Disconnected` is terminal. Connectivity failures are never
//! fatal: `connect` retries with a capped exponential backoff until it
//! succeeds or the cancellation token fires.
//! Subscriptions are reissued after every successful handshake.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::IngestSettings;
use crate::error::{IngestError, IngestResult};
use crate::transport::{BrokerTransport, QualityOfService};

/// Connection state, owned by [`ConnectionManager`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopping,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Capped exponential backoff: `initial`, `2 * initial`, ... up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    #[must_use]
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    /// Delay before the next attempt. Never decreases until [`Backoff::reset`].
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial.min(self.max),
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub filters: Vec<String>,
    pub qos: QualityOfService,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// How often the keepalive loop probes the link.
    pub keepalive_interval: Duration,
}

impl ConnectionConfig {
    #[must_use]
    pub fn new(filters: Vec<String>, qos: QualityOfService, ingest: &IngestSettings) -> Self {
        Self {
            filters,
            qos,
            backoff_initial: ingest.backoff_initial(),
            backoff_max: ingest.backoff_max(),
            keepalive_interval: ingest.keepalive_interval(),
        }
    }
}

/// Owns the transport connection and keeps the subscriptions alive.
pub struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    /// Child of `cancel`, fired first by `shutdown` so no loop reconnects
    /// while the transport is being closed.
    stopping: CancellationToken,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(transport: Arc<dyn BrokerTransport>, config: ConnectionConfig, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let stopping = cancel.child_token();
        Self {
            transport,
            config,
            state,
            cancel,
            stopping,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether `shutdown` has started.
    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connect and subscribe, retrying until success.
    ///
    /// Returns `Err(IngestError::Cancelled)` when the stop signal fires or
    /// the manager was already shut down, and the transport's error when it
    /// reports a failure that cannot be retried.
    pub async fn connect(&self) -> IngestResult<()> {
        if self.stopping.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        self.transition(ConnectionState::Connecting);
        self.establish().await
    }

    /// Reissue a subscription request for every filter.
    pub async fn subscribe(&self) -> IngestResult<()> {
        self.transport.subscribe(&self.config.filters, self.config.qos).await?;
        info!(filters = ?self.config.filters, qos = self.config.qos.level(), "subscribed to topics");
        Ok(())
    }

    /// Probe the link on a fixed interval and reconnect when it is down.
    ///
    /// Runs until the stop signal fires.
    pub async fn run_keepalive(&self) -> IngestResult<()> {
        let mut ticker = tokio::time::interval(self.config.keepalive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.stopping.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let probe = tokio::select! {
                biased;
                () = self.stopping.cancelled() => return Ok(()),
                probe = self.transport.probe() => probe,
            };
            match probe {
                Ok(true) => continue,
                Ok(false) => warn!("broker connection lost"),
                Err(e) => warn!(error = %e, "keepalive probe failed"),
            }
            if self.stopping.is_cancelled() {
                return Ok(());
            }

            self.transition(ConnectionState::Reconnecting);
            match self.establish().await {
                Ok(()) => {}
                Err(IngestError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Disconnect cleanly, then stop every dependent loop.
    ///
    /// Terminal: afterwards `connect` returns `Err(IngestError::Cancelled)`
    /// and the state stays `Disconnected`.
    pub async fn shutdown(&self) {
        self.stopping.cancel();
        self.transition(ConnectionState::Stopping);
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "error while disconnecting from broker");
        }
        self.cancel.cancel();
        self.transition(ConnectionState::Disconnected);
        info!("connection manager stopped");
    }

    async fn establish(&self) -> IngestResult<()> {
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            if self.stopping.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                () = self.stopping.cancelled() => return Err(IngestError::Cancelled),
                result = self.try_connect() => result,
            };

            match result {
                Ok(()) => {
                    backoff.reset();
                    self.transition(ConnectionState::Connected);
                    info!(attempt, "connected to broker");
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    error!(attempt, error = %e, "broker connection cannot be retried");
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "failed to connect to broker; retrying"
                    );
                    tokio::select! {
                        () = self.stopping.cancelled() => return Err(IngestError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn try_connect(&self) -> IngestResult<()> {
        self.transport.connect().await?;
        self.subscribe().await
    }

    fn transition(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            // Once stopping, the only states left are Stopping and Disconnected.
            let stopped = self.stopping.is_cancelled()
                && !matches!(next, ConnectionState::Stopping | ConnectionState::Disconnected);
            if *current == next || stopped {
                return false;
            }
            info!(from = %current, to = %next, "connection state changed");
            *current = next;
            true
        });
    }
}
