//! Cloud pub/sub backend over the Google Cloud Pub/Sub REST API (or its
//! emulator), via `reqwest`.
//!
//! Topic ids keep the flat underscore name. The adapter caches the
//! project's topic list and creates missing topics on first publish; the
//! monitor pulls from one subscription per topic and deletes (acks) each
//! message in the background once its event is enqueued.
//!
//! Pub/sub rejects empty attribute values, so an empty token or
//! correlation id is sent as [`TOKEN_SENTINEL`] / [`CORRELATION_ID_SENTINEL`]
//! and mapped back to empty on receipt.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::PubSubConfig;
use crate::dispatch::{
    Headers, PublishError, QueueAdapter, AUTHORIZATION_HEADER, CORRELATION_ID_HEADER,
};
use crate::monitor::{AckMode, InboundEvent, MonitorBackend, MonitorError, WireMessage};

/// Sent in place of an empty token.
pub const TOKEN_SENTINEL: &str = "anonymous";
/// Sent in place of an empty correlation id.
pub const CORRELATION_ID_SENTINEL: &str = "no-correlation-id";

/// Topic creation has its own budget, separate from publish retries.
const TOPIC_CREATE_ATTEMPTS: u32 = 3;
const TOPIC_CREATE_DELAY: Duration = Duration::from_millis(500);
const PULL_BATCH: u32 = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PULL_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for pub/sub REST calls.
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("pub/sub returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl PubSubError {
    /// Whether the service could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        match self {
            PubSubError::Transport(e) => e.is_connect() || e.is_timeout(),
            PubSubError::Status { .. } => false,
        }
    }

    /// Whether the request ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PubSubError::Transport(e) if e.is_timeout())
    }

    fn is_already_exists(&self) -> bool {
        matches!(self, PubSubError::Status { status: 409, .. })
    }
}

impl From<PubSubError> for PublishError {
    fn from(err: PubSubError) -> Self {
        if err.is_unreachable() {
            PublishError::Connection(err.to_string())
        } else {
            PublishError::Rejected(err.to_string())
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicList {
    #[serde(default)]
    topics: Vec<TopicResource>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct TopicResource {
    name: String,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: Vec<OutgoingMessage<'a>>,
}

#[derive(Serialize)]
struct OutgoingMessage<'a> {
    data: String,
    attributes: HashMap<&'a str, &'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
}

#[derive(Deserialize)]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: [&'a str; 1],
}

/// Thin REST client for the calls both sides need.
#[derive(Clone)]
pub struct PubSubClient {
    http: reqwest::Client,
    config: PubSubConfig,
}

impl PubSubClient {
    pub fn new(config: PubSubConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    fn topic_path(&self, topic_id: &str) -> String {
        format!("projects/{}/topics/{}", self.config.project, topic_id)
    }

    fn subscription_path(&self, subscription: &str) -> String {
        format!("projects/{}/subscriptions/{}", self.config.project, subscription)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/v1/{}", self.config.endpoint, path);
        let builder = self.http.request(method, url);
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(builder: RequestBuilder) -> Result<reqwest::Response, PubSubError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PubSubError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Every topic resource name in the project, following pagination.
    pub async fn list_topics(&self) -> Result<Vec<String>, PubSubError> {
        let path = format!("projects/{}/topics", self.config.project);
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut builder = self.request(Method::GET, &path);
            if let Some(token) = &page_token {
                builder = builder.query(&[("pageToken", token)]);
            }
            let page: TopicList = Self::send(builder).await?.json().await?;
            names.extend(page.topics.into_iter().map(|t| t.name));

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => return Ok(names),
            }
        }
    }

    /// Create a topic; an existing topic counts as success.
    pub async fn create_topic(&self, topic_id: &str) -> Result<String, PubSubError> {
        let path = self.topic_path(topic_id);
        let builder = self
            .request(Method::PUT, &path)
            .json(&serde_json::json!({}));
        match Self::send(builder).await {
            Ok(_) => Ok(path),
            Err(err) if err.is_already_exists() => Ok(path),
            Err(err) => Err(err),
        }
    }

    /// Create a subscription on a topic; an existing one counts as success.
    pub async fn create_subscription(
        &self,
        subscription: &str,
        topic_id: &str,
    ) -> Result<(), PubSubError> {
        let builder = self
            .request(Method::PUT, &self.subscription_path(subscription))
            .json(&serde_json::json!({ "topic": self.topic_path(topic_id) }));
        match Self::send(builder).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn publish(
        &self,
        topic_id: &str,
        attributes: HashMap<&str, &str>,
        body: &[u8],
    ) -> Result<(), PubSubError> {
        let request = PublishRequest {
            messages: vec![OutgoingMessage {
                data: BASE64_STANDARD.encode(body),
                attributes,
            }],
        };
        let path = format!("{}:publish", self.topic_path(topic_id));
        Self::send(self.request(Method::POST, &path).json(&request)).await?;
        Ok(())
    }

    async fn pull(
        &self,
        subscription: &str,
        timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, PubSubError> {
        let path = format!("{}:pull", self.subscription_path(subscription));
        let request = PullRequest {
            max_messages: PULL_BATCH,
        };
        let builder = self.request(Method::POST, &path).json(&request).timeout(timeout);
        let response: PullResponse = Self::send(builder)
            .await?
            .json()
            .await?;
        Ok(response.received_messages)
    }

    pub async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<(), PubSubError> {
        let path = format!("{}:acknowledge", self.subscription_path(subscription));
        let request = AcknowledgeRequest { ack_ids: [ack_id] };
        Self::send(self.request(Method::POST, &path).json(&request)).await?;
        Ok(())
    }
}

/// Attribute value for the wire, substituting a sentinel for empty values.
fn attribute<'a>(value: &'a str, sentinel: &'static str) -> &'a str {
    if value.is_empty() {
        sentinel
    } else {
        value
    }
}

/// Publishes to cloud pub/sub topics.
pub struct PubSubAdapter {
    client: PubSubClient,
    topics: RwLock<Vec<String>>,
}

impl PubSubAdapter {
    pub fn new(config: PubSubConfig) -> Self {
        Self {
            client: PubSubClient::new(config),
            topics: RwLock::new(Vec::new()),
        }
    }

    async fn is_known(&self, topic_id: &str) -> bool {
        self.topics
            .read()
            .await
            .iter()
            .any(|name| name.contains(topic_id))
    }

    async fn create_topic(&self, topic_id: &str) -> Result<(), PublishError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.create_topic(topic_id).await {
                Ok(name) => {
                    info!(topic = %topic_id, "pub/sub topic created");
                    self.topics.write().await.push(name);
                    return Ok(());
                }
                Err(err) if attempt < TOPIC_CREATE_ATTEMPTS => {
                    warn!(topic = %topic_id, attempt, error = %err, "topic creation failed, retrying");
                    tokio::time::sleep(TOPIC_CREATE_DELAY).await;
                }
                Err(err) => {
                    if err.is_unreachable() {
                        return Err(err.into());
                    }
                    return Err(PublishError::TopicCreation {
                        topic: topic_id.to_string(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl QueueAdapter for PubSubAdapter {
    async fn connect(&self) -> Result<(), PublishError> {
        let names = self.client.list_topics().await?;
        debug!(count = names.len(), "pub/sub topic cache loaded");
        *self.topics.write().await = names;
        Ok(())
    }

    async fn publish(&self, topic: &str, headers: &Headers, body: &[u8]) -> Result<(), PublishError> {
        if !self.is_known(topic).await {
            self.create_topic(topic).await?;
        }

        let attributes = HashMap::from([
            (AUTHORIZATION_HEADER, attribute(&headers.token, TOKEN_SENTINEL)),
            (
                CORRELATION_ID_HEADER,
                attribute(&headers.correlation_id, CORRELATION_ID_SENTINEL),
            ),
        ]);
        self.client.publish(topic, attributes, body).await?;
        Ok(())
    }
}

/// What the monitor needs to delete a pulled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubReceipt {
    pub subscription: String,
    pub ack_id: String,
}

struct Subscription {
    name: String,
    topic_id: String,
}

/// Pulls from one subscription per topic.
pub struct PubSubMonitor {
    client: PubSubClient,
    subscriptions: Vec<Subscription>,
    buffer: VecDeque<(WireMessage, PubSubReceipt)>,
    poll_interval: Duration,
    pull_timeout: Duration,
}

impl PubSubMonitor {
    pub fn new(config: PubSubConfig) -> Self {
        Self {
            client: PubSubClient::new(config),
            subscriptions: Vec::new(),
            buffer: VecDeque::new(),
            poll_interval: Duration::from_secs(1),
            pull_timeout: PULL_TIMEOUT,
        }
    }

    /// Delay between empty pull rounds.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Per-pull time limit. A pull that runs out of time counts as empty.
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    fn pull_error(err: PubSubError) -> MonitorError {
        if err.is_unreachable() {
            MonitorError::ConnectionLost(err.to_string())
        } else {
            MonitorError::Broker(err.to_string())
        }
    }

    fn to_wire_message(topic_id: &str, received: ReceivedMessage, subscription: &str) -> (WireMessage, PubSubReceipt) {
        let ReceivedMessage { ack_id, message } = received;
        let body = BASE64_STANDARD
            .decode(message.data.as_bytes())
            .unwrap_or_else(|_| message.data.clone().into_bytes());
        let mut attributes = message.attributes;

        let wire = WireMessage {
            routing_key: topic_id.to_string(),
            authorization: attributes.remove(AUTHORIZATION_HEADER),
            correlation_id: attributes.remove(CORRELATION_ID_HEADER),
            body,
        };
        let receipt = PubSubReceipt {
            subscription: subscription.to_string(),
            ack_id,
        };
        (wire, receipt)
    }
}

#[async_trait]
impl MonitorBackend for PubSubMonitor {
    type Receipt = PubSubReceipt;

    fn ack_mode(&self) -> AckMode {
        AckMode::Delete
    }

    fn wire_topic(&self, topic: &str) -> String {
        topic.to_string()
    }

    async fn connect(&mut self) -> Result<(), MonitorError> {
        self.subscriptions.clear();
        self.buffer.clear();
        self.client
            .list_topics()
            .await
            .map(|_| ())
            .map_err(|e| MonitorError::Connection(e.to_string()))
    }

    async fn subscribe(&mut self, wire_topics: &[String]) -> Result<(), MonitorError> {
        let existing = self
            .client
            .list_topics()
            .await
            .map_err(|e| MonitorError::Subscribe(e.to_string()))?;

        for topic_id in wire_topics {
            let path = self.client.topic_path(topic_id);
            if !existing.contains(&path) {
                self.client
                    .create_topic(topic_id)
                    .await
                    .map_err(|e| MonitorError::Subscribe(e.to_string()))?;
            }

            let name = format!("{}-{}", self.client.config.subscription_prefix, topic_id);
            self.client
                .create_subscription(&name, topic_id)
                .await
                .map_err(|e| MonitorError::Subscribe(e.to_string()))?;
            self.subscriptions.push(Subscription {
                name,
                topic_id: topic_id.clone(),
            });
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<(WireMessage, PubSubReceipt), MonitorError> {
        loop {
            if let Some(next) = self.buffer.pop_front() {
                return Ok(next);
            }

            let client = &self.client;
            let timeout = self.pull_timeout;
            let pulls = join_all(self.subscriptions.iter().map(|subscription| async move {
                (subscription, client.pull(&subscription.name, timeout).await)
            }))
            .await;

            for (subscription, pulled) in pulls {
                let received = match pulled {
                    Ok(received) => received,
                    Err(err) if err.is_timeout() => {
                        debug!(subscription = %subscription.name, "pull timed out");
                        continue;
                    }
                    Err(err) => return Err(Self::pull_error(err)),
                };
                self.buffer.extend(received.into_iter().map(|r| {
                    Self::to_wire_message(&subscription.topic_id, r, &subscription.name)
                }));
            }

            if self.buffer.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    async fn acknowledge(&mut self, receipt: PubSubReceipt) -> Result<(), MonitorError> {
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(err) = client
                .acknowledge(&receipt.subscription, &receipt.ack_id)
                .await
            {
                warn!(
                    subscription = %receipt.subscription,
                    error = %err,
                    "failed to delete pulled message"
                );
            }
        });
        Ok(())
    }

    fn normalize(&self, message: WireMessage) -> InboundEvent {
        let mut event = InboundEvent::from(message);
        if event.raw_token == TOKEN_SENTINEL {
            event.raw_token.clear();
        }
        if event.correlation_id == CORRELATION_ID_SENTINEL {
            event.correlation_id.clear();
        }
        event
    }
}
