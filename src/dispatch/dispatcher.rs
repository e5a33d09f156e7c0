//! The dispatch engine: a bounded send queue drained by one publish loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::adapter::{Headers, QueueAdapter};
use super::command::{OutboundCommand, Payload, RetryEnvelope};
use super::supervisor::{ReconnectSignal, Supervisor};

/// Tuning for the dispatch engine. Defaults match production behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Capacity of the send queue; `dispatch_event` waits when it is full.
    pub send_capacity: usize,
    /// Retries after the first failed publish (so `max_retries + 1` attempts).
    pub max_retries: u32,
    /// Fixed delay before a failed command re-enters the retry queue.
    pub retry_delay: Duration,
    /// Fixed delay between failed connection attempts.
    pub reconnect_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_capacity: 200,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl DispatchConfig {
    pub fn with_send_capacity(mut self, capacity: usize) -> Self {
        self.send_capacity = capacity;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Counters from the publish loop, returned by [`Dispatcher::shutdown`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Commands published successfully.
    pub published: usize,
    /// Failed publishes that were scheduled for another attempt.
    pub retried: usize,
    /// Commands given up on: retry budget exhausted, or still queued at shutdown.
    pub dropped: usize,
    /// Commands whose payload could not be encoded.
    pub encode_failures: usize,
}

struct Tasks {
    publisher: JoinHandle<DispatcherStats>,
    supervisor: JoinHandle<()>,
}

/// Publishes events through a [`QueueAdapter`] without ever failing the caller.
///
/// `spawn` starts two tasks on the current tokio runtime: the connection
/// supervisor, which connects the adapter before anything is published, and
/// the publish loop. Failed publishes are retried after a fixed delay; once
/// the retry budget is spent the event is dropped and the drop is logged at
/// error level. Delivery is best-effort beyond that budget.
///
/// ## Example
///
/// ```ignore
/// let dispatcher = Dispatcher::spawn(Adapter::from_config(&config)?);
///
/// dispatcher
///     .dispatch_event(token, correlation_id, "tenant_added", json!({ "id": "t1" }))
///     .await;
///
/// let stats = dispatcher.shutdown().await;
/// ```
pub struct Dispatcher {
    send_tx: mpsc::Sender<OutboundCommand>,
    shutdown: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl Dispatcher {
    /// Start the engine with the default configuration.
    pub fn spawn<A: QueueAdapter>(adapter: A) -> Self {
        Self::with_config(adapter, DispatchConfig::default())
    }

    /// Start the engine with a custom configuration.
    pub fn with_config<A: QueueAdapter>(adapter: A, config: DispatchConfig) -> Self {
        let adapter = Arc::new(adapter);
        let gate = Arc::new(Mutex::new(()));
        let shutdown = CancellationToken::new();
        let (send_tx, send_rx) = mpsc::channel(config.send_capacity.max(1));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (reconnect, signals) = ReconnectSignal::channel();

        // Taken before either task runs so the first publish waits for the
        // initial connection.
        let initial = Arc::clone(&gate).try_lock_owned().ok();

        let supervisor = Supervisor::new(
            Arc::clone(&adapter),
            Arc::clone(&gate),
            signals,
            config.reconnect_delay,
            shutdown.clone(),
        );
        let supervisor = tokio::spawn(supervisor.run(initial));

        let publish_loop = PublishLoop {
            adapter,
            gate,
            send_rx,
            retry_rx,
            retry_tx,
            reconnect,
            config,
            shutdown: shutdown.clone(),
            pending_retries: 0,
            stats: DispatcherStats::default(),
        };
        let publisher = tokio::spawn(publish_loop.run());

        Self {
            send_tx,
            shutdown,
            tasks: Mutex::new(Some(Tasks {
                publisher,
                supervisor,
            })),
        }
    }

    /// Queue an event for publishing.
    ///
    /// Returns as soon as the command is queued. When the send queue is
    /// full this waits for a free slot; events are never dropped on
    /// overflow. Publish failures are never reported here.
    pub async fn dispatch_event(
        &self,
        token: impl Into<String>,
        correlation_id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Payload>,
    ) {
        self.dispatch(OutboundCommand::new(token, correlation_id, topic, payload))
            .await
    }

    /// Queue a prepared command. See [`Dispatcher::dispatch_event`].
    pub async fn dispatch(&self, command: OutboundCommand) {
        if self.shutdown.is_cancelled() {
            warn!(topic = %command.topic, "dispatcher is shut down, discarding event");
            return;
        }
        let topic = command.topic.clone();
        if self.send_tx.send(command).await.is_err() {
            warn!(topic = %topic, "publish loop has stopped, discarding event");
        }
    }

    /// Stop both tasks and return the publish loop's counters.
    ///
    /// The publish in flight completes; commands still queued and retries
    /// still pending are dropped and counted in `dropped`.
    pub async fn shutdown(&self) -> DispatcherStats {
        self.shutdown.cancel();
        let Some(tasks) = self.tasks.lock().await.take() else {
            return DispatcherStats::default();
        };
        let _ = tasks.supervisor.await;
        tasks.publisher.await.unwrap_or_default()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct PublishLoop<A> {
    adapter: Arc<A>,
    gate: Arc<Mutex<()>>,
    send_rx: mpsc::Receiver<OutboundCommand>,
    retry_rx: mpsc::UnboundedReceiver<RetryEnvelope>,
    retry_tx: mpsc::UnboundedSender<RetryEnvelope>,
    reconnect: ReconnectSignal,
    config: DispatchConfig,
    shutdown: CancellationToken,
    /// Retries sleeping out their delay or waiting in the retry queue.
    pending_retries: usize,
    stats: DispatcherStats,
}

impl<A: QueueAdapter> PublishLoop<A> {
    async fn run(mut self) -> DispatcherStats {
        loop {
            // No new work once shutdown is requested.
            if self.shutdown.is_cancelled() {
                break;
            }
            let envelope = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(command) = self.send_rx.recv() => RetryEnvelope::first(command),
                Some(envelope) = self.retry_rx.recv() => {
                    self.pending_retries -= 1;
                    envelope
                }
                else => break,
            };

            // Pass through the gate so no publish overlaps a reconnect.
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.stats.dropped += 1;
                    break;
                }
                guard = self.gate.lock() => drop(guard),
            }

            self.publish(envelope).await;
        }

        self.drain();
        self.stats
    }

    async fn publish(&mut self, envelope: RetryEnvelope) {
        let command = &envelope.command;
        let body = match command.payload.encode() {
            Ok(body) => body,
            Err(err) => {
                error!(
                    topic = %command.topic,
                    correlation_id = %command.correlation_id,
                    error = %err,
                    "failed to encode event payload, dropping event"
                );
                self.stats.encode_failures += 1;
                return;
            }
        };

        let headers = Headers::new(command.token.clone(), command.correlation_id.clone());
        match self.adapter.publish(&command.topic, &headers, &body).await {
            Ok(()) => {
                debug!(
                    topic = %command.topic,
                    correlation_id = %command.correlation_id,
                    attempt = envelope.attempt,
                    "event published"
                );
                self.stats.published += 1;
            }
            Err(err) => {
                if err.is_connection_failure() {
                    self.reconnect.raise(err.to_string());
                }

                if envelope.attempt < self.config.max_retries {
                    warn!(
                        topic = %command.topic,
                        correlation_id = %command.correlation_id,
                        attempt = envelope.attempt,
                        error = %err,
                        "publish failed, scheduling retry"
                    );
                    self.stats.retried += 1;
                    self.schedule_retry(envelope.next());
                } else {
                    error!(
                        topic = %command.topic,
                        correlation_id = %command.correlation_id,
                        attempts = envelope.attempt + 1,
                        error = %err,
                        "publish failed permanently, dropping event"
                    );
                    self.stats.dropped += 1;
                }
            }
        }
    }

    fn schedule_retry(&mut self, envelope: RetryEnvelope) {
        let retry_tx = self.retry_tx.clone();
        let delay = self.config.retry_delay;
        let shutdown = self.shutdown.clone();
        self.pending_retries += 1;

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = retry_tx.send(envelope);
                }
            }
        });
    }

    /// Account for everything still queued once the loop stops.
    fn drain(&mut self) {
        self.send_rx.close();
        let mut abandoned = 0;
        while self.send_rx.try_recv().is_ok() {
            abandoned += 1;
        }
        abandoned += std::mem::take(&mut self.pending_retries);

        if abandoned > 0 {
            warn!(abandoned, "dispatcher stopped with undelivered events");
        }
        self.stats.dropped += abandoned;
    }
}
