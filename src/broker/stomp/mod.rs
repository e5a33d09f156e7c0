//! STOMP 1.2 broker backend (ActiveMQ, Artemis, RabbitMQ's STOMP plugin).
//!
//! The adapter sends `SEND` frames to `{destination_prefix}{routing key}`
//! and waits for the broker's `RECEIPT`. The monitor subscribes with
//! `ack:auto`, so the broker treats messages as delivered on receipt.

mod codec;

pub use codec::{StompCodec, StompError, StompFrame};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::config::StompConfig;
use crate::dispatch::{
    Headers, PublishError, QueueAdapter, AUTHORIZATION_HEADER, CORRELATION_ID_HEADER,
};
use crate::monitor::{AckMode, MonitorBackend, MonitorError, WireMessage};
use crate::routing::to_dot_routing;

/// How long to wait for CONNECTED or RECEIPT frames.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

type Session = Framed<TcpStream, StompCodec>;

/// Missed heart-beat intervals tolerated before a session counts as dead.
const HEARTBEAT_TOLERANCE: u32 = 3;

/// Open a TCP session and complete the CONNECT handshake.
///
/// Returns the session and, when the broker agreed to send heart-beats,
/// the interval it will send them at.
async fn open_session(config: &StompConfig) -> Result<(Session, Option<Duration>), StompError> {
    let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
    let mut session = Framed::new(stream, StompCodec::new());

    session
        .send(
            StompFrame::new("CONNECT")
                .header("accept-version", "1.2")
                .header("host", config.host.clone())
                .header("login", config.user.clone())
                .header("passcode", config.password.clone())
                .header("heart-beat", format!("0,{}", config.heartbeat.as_millis())),
        )
        .await?;

    let reply = tokio::time::timeout(RESPONSE_TIMEOUT, session.next())
        .await
        .map_err(|_| StompError::Timeout("CONNECTED"))?;
    match reply {
        Some(Ok(frame)) if frame.command == "CONNECTED" => {
            let interval = incoming_heartbeat(config.heartbeat, frame.get("heart-beat"));
            Ok((session, interval))
        }
        Some(Ok(frame)) if frame.command == "ERROR" => Err(StompError::Broker(frame.error_message())),
        Some(Ok(frame)) => Err(StompError::Malformed(format!(
            "expected CONNECTED, got {}",
            frame.command
        ))),
        Some(Err(err)) => Err(err),
        None => Err(StompError::Closed),
    }
}

/// Negotiated broker-to-client heart-beat interval: the larger of what we
/// asked for and what the broker offers, or none if either side is zero.
fn incoming_heartbeat(requested: Duration, reply: Option<&str>) -> Option<Duration> {
    let offered: u64 = reply?.split(',').next()?.trim().parse().ok()?;
    if offered == 0 || requested.is_zero() {
        return None;
    }
    Some(requested.max(Duration::from_millis(offered)))
}

/// Publishes to a STOMP broker.
pub struct StompAdapter {
    config: StompConfig,
    session: Mutex<Option<Session>>,
    next_receipt: AtomicU64,
}

impl StompAdapter {
    pub fn new(config: StompConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            next_receipt: AtomicU64::new(1),
        }
    }

    fn send_frame(&self, topic: &str, headers: &Headers, body: &[u8], receipt: &str) -> StompFrame {
        StompFrame::new("SEND")
            .header("destination", self.config.destination(&to_dot_routing(topic)))
            .header(AUTHORIZATION_HEADER, headers.token.clone())
            .header(CORRELATION_ID_HEADER, headers.correlation_id.clone())
            .header("content-type", "application/json")
            .header("content-length", body.len().to_string())
            .header("receipt", receipt)
            .body(body.to_vec())
    }
}

/// Send a frame and wait for the matching RECEIPT.
async fn send_with_receipt(
    session: &mut Session,
    frame: StompFrame,
    receipt: &str,
) -> Result<(), StompError> {
    session.send(frame).await?;

    let wait = async {
        loop {
            match session.next().await {
                Some(Ok(reply)) if reply.command == "RECEIPT" => {
                    if reply.get("receipt-id") == Some(receipt) {
                        return Ok(());
                    }
                }
                Some(Ok(reply)) if reply.command == "ERROR" => {
                    return Err(StompError::Broker(reply.error_message()));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err),
                None => return Err(StompError::Closed),
            }
        }
    };
    tokio::time::timeout(RESPONSE_TIMEOUT, wait)
        .await
        .map_err(|_| StompError::Timeout("RECEIPT"))?
}

#[async_trait]
impl QueueAdapter for StompAdapter {
    async fn connect(&self) -> Result<(), PublishError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let (opened, _) = open_session(&self.config)
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))?;
        info!(
            host = %self.config.host,
            port = self.config.port,
            "stomp session established"
        );
        *session = Some(opened);
        Ok(())
    }

    async fn publish(&self, topic: &str, headers: &Headers, body: &[u8]) -> Result<(), PublishError> {
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| PublishError::Connection("stomp session not established".into()))?;

        let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed).to_string();
        let frame = self.send_frame(topic, headers, body, &receipt);

        match send_with_receipt(session, frame, &receipt).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // STOMP brokers close the session after an ERROR frame, and
                // an io failure leaves it unusable either way.
                *guard = None;
                Err(PublishError::Connection(err.to_string()))
            }
        }
    }
}

/// Receives from a STOMP broker with `ack:auto` subscriptions.
pub struct StompMonitor {
    config: StompConfig,
    session: Option<Session>,
    /// Silence longer than this means the session is dead.
    idle_timeout: Option<Duration>,
}

impl StompMonitor {
    pub fn new(config: StompConfig) -> Self {
        Self {
            config,
            session: None,
            idle_timeout: None,
        }
    }

    /// Next frame from the broker. Heart-beats reset the idle timer
    /// without producing a frame.
    async fn next_frame(&mut self) -> Result<Option<Result<StompFrame, StompError>>, MonitorError> {
        let idle_timeout = self.idle_timeout;
        let session = self.session()?;
        let Some(idle) = idle_timeout else {
            return Ok(session.next().await);
        };

        session.codec_mut().take_activity();
        loop {
            match tokio::time::timeout(idle, session.next()).await {
                Ok(next) => return Ok(next),
                Err(_) if session.codec_mut().take_activity() => {}
                Err(_) => {
                    return Err(MonitorError::ConnectionLost(format!(
                        "no data from broker for {:?}",
                        idle
                    )))
                }
            }
        }
    }

    fn session(&mut self) -> Result<&mut Session, MonitorError> {
        self.session
            .as_mut()
            .ok_or_else(|| MonitorError::ConnectionLost("stomp session not established".into()))
    }

    fn to_wire_message(&self, frame: StompFrame) -> WireMessage {
        let destination = frame.get("destination").unwrap_or_default();
        let routing_key = destination
            .strip_prefix(self.config.destination_prefix.as_str())
            .unwrap_or(destination)
            .to_string();

        WireMessage {
            routing_key,
            authorization: frame.get_ignore_case(AUTHORIZATION_HEADER).map(String::from),
            correlation_id: frame.get_ignore_case(CORRELATION_ID_HEADER).map(String::from),
            body: frame.body,
        }
    }
}

#[async_trait]
impl MonitorBackend for StompMonitor {
    type Receipt = ();

    fn ack_mode(&self) -> AckMode {
        AckMode::Auto
    }

    async fn connect(&mut self) -> Result<(), MonitorError> {
        self.session = None;
        let (session, heartbeat) = open_session(&self.config)
            .await
            .map_err(|e| MonitorError::Connection(e.to_string()))?;
        self.session = Some(session);
        self.idle_timeout = heartbeat.map(|interval| interval * HEARTBEAT_TOLERANCE);
        Ok(())
    }

    async fn subscribe(&mut self, wire_topics: &[String]) -> Result<(), MonitorError> {
        let frames: Vec<StompFrame> = wire_topics
            .iter()
            .enumerate()
            .map(|(i, topic)| {
                StompFrame::new("SUBSCRIBE")
                    .header("id", format!("sub-{}", i))
                    .header("destination", self.config.destination(topic))
                    .header("ack", "auto")
            })
            .collect();

        let session = self.session()?;
        for frame in frames {
            session
                .send(frame)
                .await
                .map_err(|e| MonitorError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<(WireMessage, ()), MonitorError> {
        loop {
            let next = match self.next_frame().await {
                Ok(next) => next,
                Err(err) => {
                    self.session = None;
                    return Err(err);
                }
            };
            match next {
                Some(Ok(frame)) if frame.command == "MESSAGE" => {
                    return Ok((self.to_wire_message(frame), ()));
                }
                Some(Ok(frame)) if frame.command == "ERROR" => {
                    self.session = None;
                    return Err(MonitorError::Broker(frame.error_message()));
                }
                Some(Ok(frame)) => {
                    debug!(command = %frame.command, "ignoring stomp frame");
                }
                Some(Err(err)) => {
                    self.session = None;
                    return Err(MonitorError::ConnectionLost(err.to_string()));
                }
                None => {
                    self.session = None;
                    return Err(MonitorError::ConnectionLost("stomp session closed".into()));
                }
            }
        }
    }

    async fn acknowledge(&mut self, _receipt: ()) -> Result<(), MonitorError> {
        Ok(())
    }
}
