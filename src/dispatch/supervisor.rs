//! Connection supervisor: reconnects the adapter on demand.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::adapter::QueueAdapter;

/// Why a reconnect was requested.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionLost {
    pub reason: String,
}

/// Sending side of the capacity-1 "connection lost" channel.
///
/// Signals raised while one is already pending coalesce into it.
#[derive(Clone)]
pub(crate) struct ReconnectSignal {
    tx: mpsc::Sender<ConnectionLost>,
}

impl ReconnectSignal {
    pub fn channel() -> (Self, mpsc::Receiver<ConnectionLost>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub fn raise(&self, reason: impl Into<String>) {
        let _ = self.tx.try_send(ConnectionLost {
            reason: reason.into(),
        });
    }
}

/// Background task owning the reconnect window.
///
/// While it holds the connection gate the publish loop cannot start a
/// publish.
pub(crate) struct Supervisor<A> {
    adapter: Arc<A>,
    gate: Arc<Mutex<()>>,
    signals: mpsc::Receiver<ConnectionLost>,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
}

impl<A: QueueAdapter> Supervisor<A> {
    pub fn new(
        adapter: Arc<A>,
        gate: Arc<Mutex<()>>,
        signals: mpsc::Receiver<ConnectionLost>,
        reconnect_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            gate,
            signals,
            reconnect_delay,
            shutdown,
        }
    }

    /// Connect once with `initial` (the gate taken at construction), then
    /// serve reconnect signals until shutdown.
    pub async fn run(mut self, initial: Option<OwnedMutexGuard<()>>) {
        let guard = match initial {
            Some(guard) => guard,
            None => Arc::clone(&self.gate).lock_owned().await,
        };
        if !self.connect(guard).await {
            return;
        }

        loop {
            let lost = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                signal = self.signals.recv() => match signal {
                    Some(lost) => lost,
                    None => break,
                },
            };

            warn!(reason = %lost.reason, "connection lost, reconnecting");
            let guard = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                guard = Arc::clone(&self.gate).lock_owned() => guard,
            };
            if !self.connect(guard).await {
                break;
            }
        }
    }

    /// Retry `connect` with a fixed delay until it succeeds. Returns `false`
    /// if shutdown interrupted it. The gate is released on return.
    async fn connect(&self, _gate: OwnedMutexGuard<()>) -> bool {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                result = self.adapter.connect() => result,
            };

            match result {
                Ok(()) => {
                    info!(attempt, "broker connection established");
                    return true;
                }
                Err(err) => {
                    warn!(
                        attempt,
                        error = %err,
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "broker connection failed, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
    }
}
