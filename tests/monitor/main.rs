//! Event monitor integration tests, run against the in-memory broker.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use sourced_dispatch::broker::InMemoryBroker;
use sourced_dispatch::dispatch::Dispatcher;
use sourced_dispatch::monitor::{
    EventMonitor, InboundEvent, MonitorConfig, MonitorHandle, MonitorState, WireMessage,
};
use tokio::sync::mpsc;

#[derive(Debug, Deserialize, PartialEq)]
struct TenantAdded {
    id: String,
}

async fn subscribed(
    broker: &InMemoryBroker,
    topics: &[&str],
) -> (MonitorHandle, mpsc::Receiver<InboundEvent>) {
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let monitor = EventMonitor::spawn(
        broker.monitor(),
        topics.iter().map(|t| t.to_string()).collect(),
        signal_tx,
    );
    monitor.wait_for(MonitorState::Subscribed).await;
    (monitor, signal_rx)
}

async fn next_event(rx: &mut mpsc::Receiver<InboundEvent>) -> InboundEvent {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("event delivered in time")
        .expect("signal channel open")
}

#[tokio::test(start_paused = true)]
async fn dispatched_event_reaches_monitor() {
    let broker = InMemoryBroker::new();
    let (monitor, mut events) = subscribed(&broker, &["tenant_added"]).await;
    let dispatcher = Dispatcher::spawn(broker.clone());

    dispatcher
        .dispatch_event("abc", "cid-1", "tenant_added", json!({ "id": "t1" }))
        .await;

    let event = next_event(&mut events).await;
    assert_eq!(event.name, "tenant.added");
    assert_eq!(event.topic(), "tenant_added");
    assert_eq!(event.raw_token, "abc");
    assert_eq!(event.correlation_id, "cid-1");
    assert_eq!(
        event.decode::<TenantAdded>().unwrap(),
        TenantAdded { id: "t1".into() }
    );

    dispatcher.shutdown().await;
    let stats = monitor.shutdown().await;
    assert_eq!(stats.received, 1);
    assert_eq!(stats.connects, 1);
    assert_eq!(broker.acknowledged().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_headers_become_empty_strings() {
    let broker = InMemoryBroker::new();
    let (monitor, mut events) = subscribed(&broker, &["tenant_added"]).await;

    let delivered = broker.inject(WireMessage::new("tenant.added", br#"{"id":"t2"}"#.to_vec()));
    assert_eq!(delivered, 1);

    let event = next_event(&mut events).await;
    assert_eq!(event.raw_token, "");
    assert_eq!(event.correlation_id, "");
    assert_eq!(event.payload_str(), Some(r#"{"id":"t2"}"#));
    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn injected_message_is_delivered_exactly_once() {
    let broker = InMemoryBroker::new();
    let (monitor, mut events) = subscribed(&broker, &["tenant_added"]).await;

    broker.inject(
        WireMessage::new("tenant.added", br#"{"id":"t1"}"#.to_vec()).with_correlation_id("cid-1"),
    );

    let event = next_event(&mut events).await;
    assert_eq!(event.name, "tenant.added");
    assert_eq!(event.correlation_id, "cid-1");
    assert_eq!(event.payload, br#"{"id":"t1"}"#);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(events.try_recv().is_err());

    let stats = monitor.shutdown().await;
    assert_eq!(stats.received, 1);
}

#[tokio::test(start_paused = true)]
async fn ignores_topics_it_did_not_subscribe_to() {
    let broker = InMemoryBroker::new();
    let (monitor, mut events) = subscribed(&broker, &["tenant_added"]).await;

    assert_eq!(broker.inject(WireMessage::new("tenant.removed", b"{}".to_vec())), 0);
    broker.inject(WireMessage::new("tenant.added", b"{}".to_vec()).with_correlation_id("cid-2"));

    let event = next_event(&mut events).await;
    assert_eq!(event.name, "tenant.added");
    assert_eq!(event.correlation_id, "cid-2");
    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_losing_the_broker() {
    let broker = InMemoryBroker::new();
    let (signal_tx, mut events) = mpsc::channel(16);
    let monitor = EventMonitor::with_config(
        broker.monitor(),
        vec!["tenant_added".into()],
        signal_tx,
        MonitorConfig::default().with_reconnect_delay(Duration::from_secs(5)),
    );
    monitor.wait_for(MonitorState::Subscribed).await;

    broker.disconnect_monitors();
    monitor.wait_for(MonitorState::Disconnected).await;
    monitor.wait_for(MonitorState::Subscribed).await;

    broker.inject(WireMessage::new("tenant.added", b"{}".to_vec()));
    let event = next_event(&mut events).await;
    assert_eq!(event.name, "tenant.added");

    let stats = monitor.shutdown().await;
    assert_eq!(stats.connects, 2);
    assert_eq!(stats.disconnects, 1);
    assert_eq!(stats.received, 1);
    assert_eq!(monitor.state(), MonitorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stops_when_signal_channel_closes() {
    let broker = InMemoryBroker::new();
    let (monitor, events) = subscribed(&broker, &["tenant_added"]).await;
    drop(events);

    broker.inject(WireMessage::new("tenant.added", b"{}".to_vec()));
    monitor.wait_for(MonitorState::Stopped).await;

    // The message never made it onto the channel, so it is not acked.
    assert!(broker.acknowledged().is_empty());
    let stats = monitor.shutdown().await;
    assert_eq!(stats.received, 0);
}

#[tokio::test(start_paused = true)]
async fn full_signal_channel_delays_acknowledgement() {
    let broker = InMemoryBroker::new();
    let (signal_tx, mut events) = mpsc::channel(1);
    let monitor = EventMonitor::spawn(broker.monitor(), vec!["tenant_added".into()], signal_tx);
    monitor.wait_for(MonitorState::Subscribed).await;

    broker.inject(WireMessage::new("tenant.added", b"1".to_vec()));
    broker.inject(WireMessage::new("tenant.added", b"2".to_vec()));
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The first event fills the channel; the second waits unacked.
    assert_eq!(broker.acknowledged().len(), 1);

    assert_eq!(next_event(&mut events).await.payload, b"1");
    assert_eq!(next_event(&mut events).await.payload, b"2");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.acknowledged().len(), 2);
    monitor.shutdown().await;
}
