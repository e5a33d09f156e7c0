//! A fake pub/sub REST service on a local port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};
use sourced_dispatch::config::PubSubConfig;
use tokio::net::TcpListener;

pub const PROJECT: &str = "local-project";

#[derive(Default)]
struct FakeState {
    topics: Vec<String>,
    create_failures: u32,
    stalled_pulls: u32,
    topic_creates: usize,
    published: Vec<(String, Value)>,
    subscriptions: HashMap<String, String>,
    pending: HashMap<String, Vec<Value>>,
    next_ack: usize,
    acked: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakePubSub {
    state: Arc<Mutex<FakeState>>,
}

impl FakePubSub {
    /// Serve on an ephemeral port and return a config pointing at it.
    pub async fn start(&self) -> PubSubConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(handle).with_state(self.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        PubSubConfig {
            endpoint: format!("http://{}", addr),
            project: PROJECT.into(),
            token: None,
            subscription_prefix: "billing".into(),
        }
    }

    pub fn with_topic(self, topic_id: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .topics
            .push(format!("projects/{}/topics/{}", PROJECT, topic_id));
        self
    }

    /// Fail the next `n` topic creations with a 500.
    pub fn fail_topic_creates(&self, n: u32) {
        self.state.lock().unwrap().create_failures = n;
    }

    /// Hold the next `n` pulls for two seconds before answering empty.
    pub fn stall_pulls(&self, n: u32) {
        self.state.lock().unwrap().stalled_pulls = n;
    }

    pub fn topics(&self) -> Vec<String> {
        self.state.lock().unwrap().topics.clone()
    }

    pub fn topic_creates(&self) -> usize {
        self.state.lock().unwrap().topic_creates
    }

    /// (topic id, message) pairs in publish order.
    pub fn published(&self) -> Vec<(String, Value)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn subscriptions(&self) -> HashMap<String, String> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.lock().unwrap().acked.clone()
    }
}

fn respond(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

async fn handle(
    State(fake): State<FakePubSub>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    if method == Method::POST && uri.path().ends_with(":pull") {
        let stall = {
            let mut state = fake.state.lock().unwrap();
            let stall = state.stalled_pulls > 0;
            if stall {
                state.stalled_pulls -= 1;
            }
            stall
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return respond(StatusCode::OK, json!({ "receivedMessages": [] }));
        }
    }

    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let prefix = format!("/v1/projects/{}/", PROJECT);
    let Some(path) = uri.path().strip_prefix(prefix.as_str()) else {
        return respond(StatusCode::NOT_FOUND, json!({}));
    };
    let mut state = fake.state.lock().unwrap();

    match (method, path.split_once('/')) {
        (Method::GET, None) if path == "topics" => {
            let topics: Vec<Value> = state.topics.iter().map(|t| json!({ "name": t })).collect();
            respond(StatusCode::OK, json!({ "topics": topics }))
        }
        (Method::PUT, Some(("topics", id))) => {
            state.topic_creates += 1;
            if state.create_failures > 0 {
                state.create_failures -= 1;
                return respond(StatusCode::INTERNAL_SERVER_ERROR, json!({}));
            }
            let name = format!("projects/{}/topics/{}", PROJECT, id);
            if state.topics.contains(&name) {
                return respond(StatusCode::CONFLICT, json!({}));
            }
            state.topics.push(name.clone());
            respond(StatusCode::OK, json!({ "name": name }))
        }
        (Method::POST, Some(("topics", rest))) => {
            let Some(id) = rest.strip_suffix(":publish") else {
                return respond(StatusCode::NOT_FOUND, json!({}));
            };
            let message = body["messages"][0].clone();
            state.published.push((id.to_string(), message.clone()));

            let topic = format!("projects/{}/topics/{}", PROJECT, id);
            let subscribers: Vec<String> = state
                .subscriptions
                .iter()
                .filter(|(_, t)| **t == topic)
                .map(|(s, _)| s.clone())
                .collect();
            for subscription in subscribers {
                state.pending.entry(subscription).or_default().push(message.clone());
            }
            respond(StatusCode::OK, json!({ "messageIds": ["1"] }))
        }
        (Method::PUT, Some(("subscriptions", name))) => {
            if state.subscriptions.contains_key(name) {
                return respond(StatusCode::CONFLICT, json!({}));
            }
            let topic = body["topic"].as_str().unwrap_or_default().to_string();
            state.subscriptions.insert(name.to_string(), topic);
            respond(StatusCode::OK, json!({ "name": name }))
        }
        (Method::POST, Some(("subscriptions", rest))) => {
            if let Some(name) = rest.strip_suffix(":pull") {
                let messages = state.pending.remove(name).unwrap_or_default();
                let mut received = Vec::new();
                for message in messages {
                    state.next_ack += 1;
                    received.push(json!({
                        "ackId": format!("ack-{}", state.next_ack),
                        "message": message,
                    }));
                }
                return respond(StatusCode::OK, json!({ "receivedMessages": received }));
            }
            if rest.ends_with(":acknowledge") {
                for id in body["ackIds"].as_array().cloned().unwrap_or_default() {
                    state.acked.push(id.as_str().unwrap_or_default().to_string());
                }
                return respond(StatusCode::OK, json!({}));
            }
            respond(StatusCode::NOT_FOUND, json!({}))
        }
        _ => respond(StatusCode::NOT_FOUND, json!({})),
    }
}
