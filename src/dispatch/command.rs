//! Commands flowing through the dispatch engine.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Event payload: raw bytes sent verbatim, or a value serialized to JSON.
///
/// Structured payloads are kept as-is until the publish loop picks the
/// command up, so an unencodable value surfaces as an encode failure in the
/// loop rather than at the call site.
#[derive(Clone)]
pub enum Payload {
    Raw(Vec<u8>),
    Json(Arc<dyn EncodeJsonPayload>),
}

/// Object-safe view of a serializable payload.
pub trait EncodeJsonPayload: Send + Sync {
    fn to_json(&self) -> serde_json::Result<Vec<u8>>;
}

impl<T: Serialize + Send + Sync> EncodeJsonPayload for T {
    fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl Payload {
    /// Raw bytes, published without re-encoding.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Payload::Raw(bytes.into())
    }

    /// Any serializable value, JSON-encoded when published.
    pub fn json<T: Serialize + Send + Sync + 'static>(value: T) -> Self {
        Payload::Json(Arc::new(value))
    }

    /// Produce the wire body.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Payload::Raw(bytes) => Ok(bytes.clone()),
            Payload::Json(value) => value.as_ref().to_json(),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Raw(bytes) => f.debug_tuple("Raw").field(&bytes.len()).finish(),
            Payload::Json(_) => f.write_str("Json(..)"),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Raw(bytes.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::json(value)
    }
}

/// A request to publish one event.
#[derive(Clone, Debug)]
pub struct OutboundCommand {
    pub token: String,
    pub topic: String,
    pub correlation_id: String,
    pub payload: Payload,
}

impl OutboundCommand {
    pub fn new(
        token: impl Into<String>,
        correlation_id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            token: token.into(),
            topic: topic.into(),
            correlation_id: correlation_id.into(),
            payload: payload.into(),
        }
    }
}

/// A command on its way back through the retry queue.
#[derive(Clone, Debug)]
pub struct RetryEnvelope {
    /// Number of failed publish attempts so far, minus one.
    pub attempt: u32,
    pub command: OutboundCommand,
}

impl RetryEnvelope {
    pub fn first(command: OutboundCommand) -> Self {
        Self { attempt: 0, command }
    }

    /// The envelope for the next attempt.
    pub fn next(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            command: self.command,
        }
    }
}
