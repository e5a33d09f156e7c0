//! The capability every broker adapter provides to the dispatch engine.

use async_trait::async_trait;
use thiserror::Error;

/// Wire header carrying the caller's raw authorization token.
pub const AUTHORIZATION_HEADER: &str = "X-Authorization";
/// Wire header carrying the request correlation identifier.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Per-message headers attached to every publish.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    pub token: String,
    pub correlation_id: String,
}

impl Headers {
    pub fn new(token: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            correlation_id: correlation_id.into(),
        }
    }

    /// Header pairs under their wire names.
    pub fn pairs(&self) -> [(&'static str, &str); 2] {
        [
            (AUTHORIZATION_HEADER, self.token.as_str()),
            (CORRELATION_ID_HEADER, self.correlation_id.as_str()),
        ]
    }
}

/// Error type for adapter operations.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The transport is down or was lost mid-publish.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The broker refused the message.
    #[error("message rejected: {0}")]
    Rejected(String),
    /// The topic did not exist and could not be created.
    #[error("topic {topic} could not be created after {attempts} attempts: {reason}")]
    TopicCreation {
        topic: String,
        attempts: u32,
        reason: String,
    },
    #[error("publish error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl PublishError {
    /// Whether this failure means the connection needs to be re-established.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, PublishError::Connection(_))
    }
}

/// Backend-specific connect/publish contract.
///
/// Adapters own their live connection handle. The dispatch engine calls
/// `publish` only from its single publish loop and `connect` only from the
/// connection supervisor while it holds the connection gate, so the two are
/// never invoked concurrently.
#[async_trait]
pub trait QueueAdapter: Send + Sync + 'static {
    /// (Re)establish the transport session. Idempotent: an already healthy
    /// connection is kept.
    async fn connect(&self) -> Result<(), PublishError>;

    /// Publish one message. `topic` is the logical underscore name; the
    /// adapter applies its own routing-key convention.
    async fn publish(&self, topic: &str, headers: &Headers, body: &[u8]) -> Result<(), PublishError>;
}

#[async_trait]
impl<A: QueueAdapter + ?Sized> QueueAdapter for std::sync::Arc<A> {
    async fn connect(&self) -> Result<(), PublishError> {
        (**self).connect().await
    }

    async fn publish(&self, topic: &str, headers: &Headers, body: &[u8]) -> Result<(), PublishError> {
        (**self).publish(topic, headers, body).await
    }
}
