//! Heartbeat Manager
//!
//! Bybit closes public connections that stay silent for more than ten
//! minutes and recommends an application-level `{"op":"ping"}` every 20
//! seconds. The manager asks the connection to ping on every interval tick
//! and reports a timeout when a ping stays unanswered for longer than the
//! pong timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::WebSocketSettings;

/// Heartbeat timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// How long a ping may stay unanswered.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(20),
        }
    }
}

impl From<&WebSocketSettings> for HeartbeatConfig {
    fn from(settings: &WebSocketSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// The connection should send a ping now.
    SendPing,
    /// A ping went unanswered; the connection should be restarted.
    Timeout {
        /// Time since the unanswered ping was sent.
        elapsed: Duration,
    },
}

/// Outstanding-ping tracker shared with the connection read loop.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    outstanding_since: Mutex<Option<Instant>>,
}

impl HeartbeatState {
    /// Create state with no outstanding ping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a ping was written. Keeps the earliest unanswered ping.
    pub fn mark_ping_sent(&self) {
        self.outstanding_since.lock().get_or_insert_with(Instant::now);
    }

    /// Record a pong, clearing the outstanding ping.
    pub fn record_pong(&self) {
        *self.outstanding_since.lock() = None;
    }

    /// Time since the oldest unanswered ping, if any.
    #[must_use]
    pub fn outstanding_for(&self) -> Option<Duration> {
        self.outstanding_since.lock().map(|sent| sent.elapsed())
    }

    /// Clear state for a new connection.
    pub fn reset(&self) {
        self.record_pong();
    }
}

/// Interval-driven heartbeat loop for one connection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use bybit_public_stream::infrastructure::bybit::heartbeat::{
///     HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
/// };
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let state = Arc::new(HeartbeatState::new());
///     let (event_tx, mut event_rx) = mpsc::channel(4);
///     let cancel = CancellationToken::new();
///
///     let manager = HeartbeatManager::new(
///         HeartbeatConfig::default(),
///         Arc::clone(&state),
///         event_tx,
///         cancel.child_token(),
///     );
///     tokio::spawn(manager.run());
///
///     while let Some(event) = event_rx.recv().await {
///         match event {
///             HeartbeatEvent::SendPing => state.mark_ping_sent(),
///             HeartbeatEvent::Timeout { .. } => break,
///         }
///     }
/// }
/// ```
#[derive(Debug)]
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a manager reporting to `event_tx` until `cancel` fires.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the event channel closes, or a timeout is reported.
    pub async fn run(self) {
        let start = tokio::time::Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let event = self.next_event();
                    let timed_out = matches!(event, HeartbeatEvent::Timeout { .. });

                    if self.event_tx.send(event).await.is_err() {
                        tracing::debug!("Heartbeat channel closed");
                        break;
                    }
                    if timed_out {
                        break;
                    }
                }
            }
        }
    }

    fn next_event(&self) -> HeartbeatEvent {
        match self.state.outstanding_for() {
            Some(elapsed) if elapsed > self.config.pong_timeout => {
                tracing::warn!(
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    timeout_ms = u64::try_from(self.config.pong_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Heartbeat timeout"
                );
                HeartbeatEvent::Timeout { elapsed }
            }
            _ => HeartbeatEvent::SendPing,
        }
    }
}
