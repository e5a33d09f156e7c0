//! The event monitor: a reconnecting subscribe/receive loop.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{MonitorBackend, MonitorError};
use super::event::InboundEvent;

/// Where a monitor is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Disconnected,
    Connecting,
    Subscribed,
    /// Shut down, or the signal channel was closed.
    Stopped,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorState::Disconnected => write!(f, "disconnected"),
            MonitorState::Connecting => write!(f, "connecting"),
            MonitorState::Subscribed => write!(f, "subscribed"),
            MonitorState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Fixed delay between reconnect attempts. There is no attempt limit.
    pub reconnect_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl MonitorConfig {
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Counters from a monitor, returned by [`MonitorHandle::shutdown`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorStats {
    /// Events pushed onto the signal channel.
    pub received: usize,
    /// Sessions that reached `Subscribed`.
    pub connects: usize,
    /// Sessions that ended in an error.
    pub disconnects: usize,
}

/// Spawns monitors.
///
/// ## Example
///
/// ```ignore
/// let (signal_tx, mut signal_rx) = tokio::sync::mpsc::channel(100);
/// let monitor = EventMonitor::spawn(
///     Monitor::from_config(&config),
///     vec!["tenant_added".into()],
///     signal_tx,
/// );
///
/// while let Some(event) = signal_rx.recv().await {
///     handle(event);
/// }
/// ```
pub struct EventMonitor;

impl EventMonitor {
    /// Start a monitor with the default configuration.
    pub fn spawn<B: MonitorBackend>(
        backend: B,
        topics: Vec<String>,
        signal: mpsc::Sender<InboundEvent>,
    ) -> MonitorHandle {
        Self::with_config(backend, topics, signal, MonitorConfig::default())
    }

    /// Start a monitor with a custom configuration.
    pub fn with_config<B: MonitorBackend>(
        backend: B,
        topics: Vec<String>,
        signal: mpsc::Sender<InboundEvent>,
        config: MonitorConfig,
    ) -> MonitorHandle {
        let (state_tx, state_rx) = watch::channel(MonitorState::Disconnected);
        let shutdown = CancellationToken::new();

        let monitor_loop = MonitorLoop {
            backend,
            topics,
            signal,
            config,
            state: state_tx,
            shutdown: shutdown.clone(),
            stats: MonitorStats::default(),
        };
        let task = tokio::spawn(monitor_loop.run());

        MonitorHandle {
            state: state_rx,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Handle to a running monitor. Dropping it stops the monitor.
pub struct MonitorHandle {
    state: watch::Receiver<MonitorState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<MonitorStats>>>,
}

impl MonitorHandle {
    /// The current lifecycle state.
    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Wait until the monitor reaches `state`.
    pub async fn wait_for(&self, state: MonitorState) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// Stop the monitor and return its counters.
    pub async fn shutdown(&self) -> MonitorStats {
        self.shutdown.cancel();
        let Some(task) = self.task.lock().await.take() else {
            return MonitorStats::default();
        };
        task.await.unwrap_or_default()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct MonitorLoop<B> {
    backend: B,
    topics: Vec<String>,
    signal: mpsc::Sender<InboundEvent>,
    config: MonitorConfig,
    state: watch::Sender<MonitorState>,
    shutdown: CancellationToken,
    stats: MonitorStats,
}

/// How a session ended without an error.
enum SessionEnd {
    SignalClosed,
}

impl<B: MonitorBackend> MonitorLoop<B> {
    async fn run(mut self) -> MonitorStats {
        let shutdown = self.shutdown.clone();

        loop {
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.session() => outcome,
            };

            match outcome {
                Ok(SessionEnd::SignalClosed) => {
                    info!("signal channel closed, stopping monitor");
                    break;
                }
                Err(err) => {
                    self.stats.disconnects += 1;
                    self.set_state(MonitorState::Disconnected);
                    warn!(
                        error = %err,
                        delay_ms = self.config.reconnect_delay.as_millis() as u64,
                        "monitor session failed, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }

        self.set_state(MonitorState::Stopped);
        self.stats
    }

    async fn session(&mut self) -> Result<SessionEnd, MonitorError> {
        self.set_state(MonitorState::Connecting);
        self.backend.connect().await?;

        let wire_topics: Vec<String> = self
            .topics
            .iter()
            .map(|topic| self.backend.wire_topic(topic))
            .collect();
        self.backend.subscribe(&wire_topics).await?;

        self.stats.connects += 1;
        self.set_state(MonitorState::Subscribed);
        info!(topics = ?wire_topics, "monitor subscribed");

        loop {
            let (message, receipt) = self.backend.receive().await?;
            let event = self.backend.normalize(message);
            debug!(
                name = %event.name,
                correlation_id = %event.correlation_id,
                "event received"
            );

            if self.signal.send(event).await.is_err() {
                return Ok(SessionEnd::SignalClosed);
            }
            self.stats.received += 1;

            self.backend.acknowledge(receipt).await?;
        }
    }

    fn set_state(&self, state: MonitorState) {
        self.state.send_replace(state);
    }
}
