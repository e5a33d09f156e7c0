//! Broker backends.
//!
//! Each family provides a [`QueueAdapter`] for the dispatcher and a
//! [`MonitorBackend`] for the event monitor:
//!
//! | Family  | Adapter            | Monitor            | Ack mode   |
//! |---------|--------------------|--------------------|------------|
//! | AMQP    | [`AmqpAdapter`]    | [`AmqpMonitor`]    | explicit   |
//! | STOMP   | [`StompAdapter`]   | [`StompMonitor`]   | auto       |
//! | Pub/sub | [`PubSubAdapter`]  | [`PubSubMonitor`]  | delete     |
//! | Memory  | [`InMemoryBroker`] | [`InMemoryMonitor`]| explicit   |
//!
//! [`Adapter`] and [`Monitor`] pick one of the three network families at
//! runtime from a [`BrokerConfig`].

mod amqp;
mod in_memory;
mod pubsub;
mod stomp;

pub use amqp::{AmqpAdapter, AmqpMonitor};
pub use in_memory::{InMemoryBroker, InMemoryMonitor, PublishedMessage};
pub use pubsub::{
    PubSubAdapter, PubSubClient, PubSubError, PubSubMonitor, PubSubReceipt,
    CORRELATION_ID_SENTINEL, TOKEN_SENTINEL,
};
pub use stomp::{StompAdapter, StompCodec, StompError, StompFrame, StompMonitor};

use async_trait::async_trait;

use crate::config::BrokerConfig;
use crate::dispatch::{Headers, PublishError, QueueAdapter};
use crate::monitor::{AckMode, InboundEvent, MonitorBackend, MonitorError, WireMessage};

/// The configured publishing backend.
pub enum Adapter {
    Amqp(AmqpAdapter),
    Stomp(StompAdapter),
    PubSub(PubSubAdapter),
}

impl Adapter {
    pub fn from_config(config: &BrokerConfig) -> Self {
        match config {
            BrokerConfig::Amqp(c) => Adapter::Amqp(AmqpAdapter::new(c.clone())),
            BrokerConfig::Stomp(c) => Adapter::Stomp(StompAdapter::new(c.clone())),
            BrokerConfig::PubSub(c) => Adapter::PubSub(PubSubAdapter::new(c.clone())),
        }
    }
}

#[async_trait]
impl QueueAdapter for Adapter {
    async fn connect(&self) -> Result<(), PublishError> {
        match self {
            Adapter::Amqp(a) => a.connect().await,
            Adapter::Stomp(a) => a.connect().await,
            Adapter::PubSub(a) => a.connect().await,
        }
    }

    async fn publish(&self, topic: &str, headers: &Headers, body: &[u8]) -> Result<(), PublishError> {
        match self {
            Adapter::Amqp(a) => a.publish(topic, headers, body).await,
            Adapter::Stomp(a) => a.publish(topic, headers, body).await,
            Adapter::PubSub(a) => a.publish(topic, headers, body).await,
        }
    }
}

/// The configured monitor backend.
pub enum Monitor {
    Amqp(AmqpMonitor),
    Stomp(StompMonitor),
    PubSub(PubSubMonitor),
}

/// Acknowledgement handle for whichever backend produced the message.
pub enum Receipt {
    Amqp(lapin::acker::Acker),
    Stomp,
    PubSub(PubSubReceipt),
}

impl Monitor {
    pub fn from_config(config: &BrokerConfig) -> Self {
        match config {
            BrokerConfig::Amqp(c) => Monitor::Amqp(AmqpMonitor::new(c.clone())),
            BrokerConfig::Stomp(c) => Monitor::Stomp(StompMonitor::new(c.clone())),
            BrokerConfig::PubSub(c) => Monitor::PubSub(PubSubMonitor::new(c.clone())),
        }
    }
}

#[async_trait]
impl MonitorBackend for Monitor {
    type Receipt = Receipt;

    fn ack_mode(&self) -> AckMode {
        match self {
            Monitor::Amqp(m) => m.ack_mode(),
            Monitor::Stomp(m) => m.ack_mode(),
            Monitor::PubSub(m) => m.ack_mode(),
        }
    }

    fn wire_topic(&self, topic: &str) -> String {
        match self {
            Monitor::Amqp(m) => m.wire_topic(topic),
            Monitor::Stomp(m) => m.wire_topic(topic),
            Monitor::PubSub(m) => m.wire_topic(topic),
        }
    }

    async fn connect(&mut self) -> Result<(), MonitorError> {
        match self {
            Monitor::Amqp(m) => m.connect().await,
            Monitor::Stomp(m) => m.connect().await,
            Monitor::PubSub(m) => m.connect().await,
        }
    }

    async fn subscribe(&mut self, wire_topics: &[String]) -> Result<(), MonitorError> {
        match self {
            Monitor::Amqp(m) => m.subscribe(wire_topics).await,
            Monitor::Stomp(m) => m.subscribe(wire_topics).await,
            Monitor::PubSub(m) => m.subscribe(wire_topics).await,
        }
    }

    async fn receive(&mut self) -> Result<(WireMessage, Receipt), MonitorError> {
        match self {
            Monitor::Amqp(m) => m.receive().await.map(|(msg, r)| (msg, Receipt::Amqp(r))),
            Monitor::Stomp(m) => m.receive().await.map(|(msg, ())| (msg, Receipt::Stomp)),
            Monitor::PubSub(m) => m.receive().await.map(|(msg, r)| (msg, Receipt::PubSub(r))),
        }
    }

    async fn acknowledge(&mut self, receipt: Receipt) -> Result<(), MonitorError> {
        match (self, receipt) {
            (Monitor::Amqp(m), Receipt::Amqp(r)) => m.acknowledge(r).await,
            (Monitor::Stomp(m), Receipt::Stomp) => m.acknowledge(()).await,
            (Monitor::PubSub(m), Receipt::PubSub(r)) => m.acknowledge(r).await,
            _ => Err(MonitorError::Broker(
                "receipt does not belong to this backend".into(),
            )),
        }
    }

    fn normalize(&self, message: WireMessage) -> InboundEvent {
        match self {
            Monitor::Amqp(m) => m.normalize(message),
            Monitor::Stomp(m) => m.normalize(message),
            Monitor::PubSub(m) => m.normalize(message),
        }
    }
}
