//! The capability each broker provides to the event monitor.

use async_trait::async_trait;
use thiserror::Error;

use super::event::{InboundEvent, WireMessage};
use crate::routing::to_dot_routing;

/// How a backend acknowledges delivered messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Ack after the event is on the signal channel (at-least-once).
    Explicit,
    /// The broker considers the message delivered on receipt.
    Auto,
    /// Polling backends: issue a fire-and-forget delete after enqueueing.
    Delete,
}

/// Error type for monitor backends.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("subscription failed: {0}")]
    Subscribe(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("acknowledge failed: {0}")]
    Acknowledge(String),
    #[error("broker error: {0}")]
    Broker(String),
}

/// Backend-specific subscribe/receive contract.
///
/// The monitor drives a backend through connect → subscribe → receive; any
/// error sends it back to connect.
#[async_trait]
pub trait MonitorBackend: Send + 'static {
    /// Whatever the backend needs to acknowledge one message.
    type Receipt: Send + 'static;

    fn ack_mode(&self) -> AckMode;

    /// Translate a logical topic into the name this broker subscribes to.
    fn wire_topic(&self, topic: &str) -> String {
        to_dot_routing(topic)
    }

    /// Establish a fresh session, discarding any previous one.
    async fn connect(&mut self) -> Result<(), MonitorError>;

    /// Register interest in `wire_topics`.
    async fn subscribe(&mut self, wire_topics: &[String]) -> Result<(), MonitorError>;

    /// Wait for the next message.
    async fn receive(&mut self) -> Result<(WireMessage, Self::Receipt), MonitorError>;

    /// Acknowledge a message once its event has been enqueued.
    async fn acknowledge(&mut self, receipt: Self::Receipt) -> Result<(), MonitorError>;

    /// Turn a wire message into the canonical event.
    fn normalize(&self, message: WireMessage) -> InboundEvent {
        InboundEvent::from(message)
    }
}
