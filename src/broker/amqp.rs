//! AMQP 0-9-1 topic-exchange backend (RabbitMQ and compatible), via `lapin`.
//!
//! The adapter declares a durable topic exchange once per connection and
//! publishes persistent JSON messages under dot routing keys with publisher
//! confirms. The monitor binds a durable per-service queue to every
//! configured routing key and acks each delivery only after its event is
//! on the signal channel.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::RwLock;
use tracing::info;

use crate::config::AmqpConfig;
use crate::dispatch::{
    Headers, PublishError, QueueAdapter, AUTHORIZATION_HEADER, CORRELATION_ID_HEADER,
};
use crate::monitor::{AckMode, MonitorBackend, MonitorError, WireMessage};
use crate::routing::to_dot_routing;

/// Unacked deliveries a monitor may hold at once.
const PREFETCH: u16 = 50;
/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    /// Connect, open a channel, and declare the exchange. Redeclaring an
    /// existing durable exchange with the same parameters is a no-op.
    async fn open(config: &AmqpConfig) -> Result<Self, lapin::Error> {
        let connection = Connection::connect(&config.uri(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(Self {
            connection,
            channel,
        })
    }

    fn is_healthy(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// AMQP headers table carrying the token and correlation id.
fn header_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers.pairs() {
        table.insert(
            ShortString::from(name.to_string()),
            AMQPValue::LongString(LongString::from(value.to_string())),
        );
    }
    table
}

/// A string header from an AMQP headers table, matched ignoring case.
fn header_value(table: Option<&FieldTable>, name: &str) -> Option<String> {
    let (_, value) = table?
        .inner()
        .iter()
        .find(|(key, _)| key.as_str().eq_ignore_ascii_case(name))?;
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

/// Publishes to an AMQP topic exchange.
pub struct AmqpAdapter {
    config: AmqpConfig,
    session: RwLock<Option<AmqpSession>>,
}

impl AmqpAdapter {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            session: RwLock::new(None),
        }
    }
}

#[async_trait]
impl QueueAdapter for AmqpAdapter {
    async fn connect(&self) -> Result<(), PublishError> {
        let mut session = self.session.write().await;
        if session.as_ref().is_some_and(AmqpSession::is_healthy) {
            return Ok(());
        }

        let opened = AmqpSession::open(&self.config)
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;
        opened
            .channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        info!(
            host = %self.config.host,
            exchange = %self.config.exchange,
            "amqp connection established"
        );
        *session = Some(opened);
        Ok(())
    }

    async fn publish(&self, topic: &str, headers: &Headers, body: &[u8]) -> Result<(), PublishError> {
        let guard = self.session.read().await;
        let session = match guard.as_ref() {
            Some(session) if session.is_healthy() => session,
            _ => return Err(PublishError::Connection("amqp connection is not open".into())),
        };

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json".to_string()))
            .with_delivery_mode(PERSISTENT)
            .with_headers(header_table(headers));

        let classify = |err: lapin::Error| {
            if session.is_healthy() {
                PublishError::Rejected(err.to_string())
            } else {
                PublishError::Connection(err.to_string())
            }
        };

        let confirmation = session
            .channel
            .basic_publish(
                &self.config.exchange,
                &to_dot_routing(topic),
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(classify)?
            .await
            .map_err(classify)?;

        if confirmation.is_nack() {
            return Err(PublishError::Rejected("broker nacked the message".into()));
        }
        Ok(())
    }
}

/// Consumes from a durable queue bound to the configured routing keys.
pub struct AmqpMonitor {
    config: AmqpConfig,
    session: Option<AmqpSession>,
    consumer: Option<Consumer>,
}

impl AmqpMonitor {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            session: None,
            consumer: None,
        }
    }

    fn channel(&self) -> Result<&Channel, MonitorError> {
        self.session
            .as_ref()
            .map(|s| &s.channel)
            .ok_or_else(|| MonitorError::ConnectionLost("amqp channel not open".into()))
    }
}

#[async_trait]
impl MonitorBackend for AmqpMonitor {
    type Receipt = Acker;

    fn ack_mode(&self) -> AckMode {
        AckMode::Explicit
    }

    async fn connect(&mut self) -> Result<(), MonitorError> {
        self.consumer = None;
        self.session = None;

        let session = AmqpSession::open(&self.config)
            .await
            .map_err(|e| MonitorError::Connection(e.to_string()))?;
        session
            .channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .map_err(|e| MonitorError::Connection(e.to_string()))?;
        self.session = Some(session);
        Ok(())
    }

    async fn subscribe(&mut self, wire_topics: &[String]) -> Result<(), MonitorError> {
        let channel = self.channel()?.clone();
        let subscribe_err = |e: lapin::Error| MonitorError::Subscribe(e.to_string());

        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(subscribe_err)?;

        for routing_key in wire_topics {
            channel
                .queue_bind(
                    &self.config.queue,
                    &self.config.exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(subscribe_err)?;
        }

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                &format!("{}-monitor", self.config.queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(subscribe_err)?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn receive(&mut self) -> Result<(WireMessage, Acker), MonitorError> {
        let consumer = self
            .consumer
            .as_mut()
            .ok_or_else(|| MonitorError::ConnectionLost("amqp consumer not started".into()))?;

        match consumer.next().await {
            Some(Ok(delivery)) => {
                let headers = delivery.properties.headers().as_ref();
                let message = WireMessage {
                    routing_key: delivery.routing_key.as_str().to_string(),
                    authorization: header_value(headers, AUTHORIZATION_HEADER),
                    correlation_id: header_value(headers, CORRELATION_ID_HEADER),
                    body: delivery.data,
                };
                Ok((message, delivery.acker))
            }
            Some(Err(err)) => Err(MonitorError::ConnectionLost(err.to_string())),
            None => Err(MonitorError::ConnectionLost("amqp consumer closed".into())),
        }
    }

    async fn acknowledge(&mut self, receipt: Acker) -> Result<(), MonitorError> {
        receipt
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| MonitorError::Acknowledge(e.to_string()))
    }
}
