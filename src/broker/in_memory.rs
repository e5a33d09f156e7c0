//! In-memory broker for testing and single-process scenarios.
//!
//! `InMemoryBroker` is both a [`QueueAdapter`] and a source of
//! [`InMemoryMonitor`]s, useful for:
//! - Unit and integration testing without a running broker
//! - Single-process applications
//! - Development and prototyping

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::dispatch::{Headers, PublishError, QueueAdapter};
use crate::monitor::{AckMode, MonitorBackend, MonitorError, WireMessage};
use crate::routing::to_dot_routing;

/// A message recorded by the in-memory broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Dot routing key the message was published under.
    pub routing_key: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl PublishedMessage {
    /// Get the body as a string (if valid UTF-8).
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

struct Subscription {
    routing_keys: Vec<String>,
    tx: mpsc::UnboundedSender<(WireMessage, u64)>,
}

#[derive(Default)]
struct Inner {
    log: RwLock<Vec<PublishedMessage>>,
    subscriptions: Mutex<Vec<Subscription>>,
    acked: Mutex<Vec<u64>>,
    failures_remaining: AtomicU32,
    connects: AtomicUsize,
    next_tag: AtomicU64,
}

/// In-memory broker.
///
/// Features:
/// - Cheap to clone; clones share the same log and subscriptions
/// - Every publish is kept in an append-only log
/// - Published messages fan out to subscribed monitors by routing key
/// - Scripted publish failures for exercising retries
///
/// ## Example
///
/// ```
/// use sourced_dispatch::broker::InMemoryBroker;
/// use sourced_dispatch::dispatch::{Headers, QueueAdapter};
///
/// # tokio_test_block_on(async {
/// let broker = InMemoryBroker::new();
/// broker
///     .publish("tenant_added", &Headers::new("abc", "cid-1"), br#"{"id":"t1"}"#)
///     .await
///     .unwrap();
///
/// assert_eq!(broker.routing_keys(), vec!["tenant.added"]);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with a connection error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// A monitor backend reading from this broker.
    pub fn monitor(&self) -> InMemoryMonitor {
        InMemoryMonitor {
            broker: self.clone(),
            rx: None,
        }
    }

    /// Deliver a synthetic wire message to every matching monitor without
    /// recording it as published. Returns how many monitors received it.
    pub fn inject(&self, message: WireMessage) -> usize {
        self.deliver(message)
    }

    /// Drop every monitor subscription, as if the broker went away.
    pub fn disconnect_monitors(&self) {
        self.lock_subscriptions().clear();
    }

    /// Get all published messages.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.read_log().clone()
    }

    /// Get all routing keys in publish order.
    pub fn routing_keys(&self) -> Vec<String> {
        self.read_log()
            .iter()
            .map(|m| m.routing_key.clone())
            .collect()
    }

    /// Get the total number of published messages.
    pub fn len(&self) -> usize {
        self.read_log().len()
    }

    /// Check if nothing has been published.
    pub fn is_empty(&self) -> bool {
        self.read_log().is_empty()
    }

    /// Number of times `connect` was called.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Delivery tags acknowledged by monitors.
    pub fn acknowledged(&self) -> Vec<u64> {
        self.inner
            .acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn read_log(&self) -> std::sync::RwLockReadGuard<'_, Vec<PublishedMessage>> {
        self.inner.log.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> bool {
        self.inner
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn deliver(&self, message: WireMessage) -> usize {
        let mut subscriptions = self.lock_subscriptions();
        subscriptions.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for subscription in subscriptions.iter() {
            if subscription
                .routing_keys
                .iter()
                .any(|key| *key == message.routing_key)
            {
                let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst);
                if subscription.tx.send((message.clone(), tag)).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

#[async_trait]
impl QueueAdapter for InMemoryBroker {
    async fn connect(&self) -> Result<(), PublishError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, headers: &Headers, body: &[u8]) -> Result<(), PublishError> {
        if self.take_failure() {
            return Err(PublishError::Connection("in-memory broker unavailable".into()));
        }

        let routing_key = to_dot_routing(topic);
        self.inner
            .log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                routing_key: routing_key.clone(),
                headers: headers.clone(),
                body: body.to_vec(),
            });

        let mut message = WireMessage::new(routing_key, body.to_vec());
        if !headers.token.is_empty() {
            message = message.with_authorization(headers.token.clone());
        }
        if !headers.correlation_id.is_empty() {
            message = message.with_correlation_id(headers.correlation_id.clone());
        }
        self.deliver(message);
        Ok(())
    }
}

/// Monitor backend attached to an [`InMemoryBroker`].
///
/// Acknowledges explicitly; acked delivery tags are visible through
/// [`InMemoryBroker::acknowledged`].
pub struct InMemoryMonitor {
    broker: InMemoryBroker,
    rx: Option<mpsc::UnboundedReceiver<(WireMessage, u64)>>,
}

#[async_trait]
impl MonitorBackend for InMemoryMonitor {
    type Receipt = u64;

    fn ack_mode(&self) -> AckMode {
        AckMode::Explicit
    }

    async fn connect(&mut self) -> Result<(), MonitorError> {
        self.rx = None;
        Ok(())
    }

    async fn subscribe(&mut self, wire_topics: &[String]) -> Result<(), MonitorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.lock_subscriptions().push(Subscription {
            routing_keys: wire_topics.to_vec(),
            tx,
        });
        self.rx = Some(rx);
        Ok(())
    }

    async fn receive(&mut self) -> Result<(WireMessage, u64), MonitorError> {
        let rx = self
            .rx
            .as_mut()
            .ok_or_else(|| MonitorError::ConnectionLost("not subscribed".into()))?;
        rx.recv()
            .await
            .ok_or_else(|| MonitorError::ConnectionLost("in-memory subscription closed".into()))
    }

    async fn acknowledge(&mut self, receipt: u64) -> Result<(), MonitorError> {
        self.broker
            .inner
            .acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(receipt);
        Ok(())
    }
}
