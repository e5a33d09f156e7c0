//! Inbound event records.

use serde::de::DeserializeOwned;

use crate::routing::{to_dot_routing, to_underscore_routing};

/// A message as a backend received it, before normalization.
///
/// Headers the broker did not carry are `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WireMessage {
    /// Routing key or topic the message arrived on, in the wire convention.
    pub routing_key: String,
    pub authorization: Option<String>,
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

impl WireMessage {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_authorization(mut self, token: impl Into<String>) -> Self {
        self.authorization = Some(token.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// The canonical form of a received event, whatever broker delivered it.
///
/// `name` is always the dot routing key (`tenant.added`); use
/// [`InboundEvent::topic`] for the logical underscore name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEvent {
    pub raw_token: String,
    pub correlation_id: String,
    pub name: String,
    pub payload: Vec<u8>,
}

impl InboundEvent {
    /// Logical topic name (`tenant_added`).
    pub fn topic(&self) -> String {
        to_underscore_routing(&self.name)
    }

    /// The payload as a string, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Decode a JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

impl From<WireMessage> for InboundEvent {
    /// Missing headers become empty strings rather than rejecting the message.
    fn from(message: WireMessage) -> Self {
        Self {
            raw_token: message.authorization.unwrap_or_default(),
            correlation_id: message.correlation_id.unwrap_or_default(),
            name: to_dot_routing(&message.routing_key),
            payload: message.body,
        }
    }
}
