//! STOMP backend tests against a scripted broker on a local socket.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sourced_dispatch::broker::{StompAdapter, StompCodec, StompFrame, StompMonitor};
use sourced_dispatch::config::StompConfig;
use sourced_dispatch::dispatch::{Headers, PublishError, QueueAdapter};
use sourced_dispatch::monitor::{EventMonitor, MonitorConfig, MonitorState};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

type BrokerSide = Framed<tokio::net::TcpStream, StompCodec>;

async fn listen() -> (TcpListener, StompConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = StompConfig {
        host: "127.0.0.1".into(),
        port,
        ..StompConfig::default()
    };
    (listener, config)
}

/// Accept one client and answer its CONNECT.
async fn accept(listener: &TcpListener) -> (BrokerSide, StompFrame) {
    accept_with(listener, StompFrame::new("CONNECTED").header("version", "1.2")).await
}

async fn accept_with(listener: &TcpListener, connected: StompFrame) -> (BrokerSide, StompFrame) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(stream, StompCodec::new());
    let connect = framed.next().await.unwrap().unwrap();
    framed.send(connected).await.unwrap();
    (framed, connect)
}

fn heartbeat_config(config: StompConfig) -> StompConfig {
    StompConfig {
        heartbeat: Duration::from_millis(100),
        ..config
    }
}

#[tokio::test]
async fn publish_waits_for_receipt() {
    let (listener, config) = listen().await;
    let broker = tokio::spawn(async move {
        let (mut framed, connect) = accept(&listener).await;
        let send = framed.next().await.unwrap().unwrap();
        let receipt = send.get("receipt").unwrap().to_string();
        framed
            .send(StompFrame::new("RECEIPT").header("receipt-id", receipt))
            .await
            .unwrap();
        (connect, send)
    });

    let adapter = StompAdapter::new(config);
    adapter.connect().await.unwrap();
    adapter
        .publish("tenant_added", &Headers::new("abc", "cid-1"), br#"{"id":"t1"}"#)
        .await
        .unwrap();

    let (connect, send) = broker.await.unwrap();
    assert_eq!(connect.command, "CONNECT");
    assert_eq!(connect.get("login"), Some("admin"));
    assert_eq!(connect.get("accept-version"), Some("1.2"));
    assert_eq!(connect.get("heart-beat"), Some("0,10000"));

    assert_eq!(send.command, "SEND");
    assert_eq!(send.get("destination"), Some("/topic/tenant.added"));
    assert_eq!(send.get("X-Authorization"), Some("abc"));
    assert_eq!(send.get("X-Correlation-ID"), Some("cid-1"));
    assert_eq!(send.get("content-type"), Some("application/json"));
    assert_eq!(send.body, br#"{"id":"t1"}"#);
}

#[tokio::test]
async fn error_frame_is_a_connection_failure() {
    let (listener, config) = listen().await;
    let broker = tokio::spawn(async move {
        let (mut framed, _) = accept(&listener).await;
        let _send = framed.next().await.unwrap().unwrap();
        framed
            .send(StompFrame::new("ERROR").header("message", "destination forbidden"))
            .await
            .unwrap();
    });

    let adapter = StompAdapter::new(config);
    adapter.connect().await.unwrap();
    let err = adapter
        .publish("tenant_added", &Headers::default(), b"{}")
        .await
        .unwrap_err();
    broker.await.unwrap();

    assert!(err.is_connection_failure());
    assert!(err.to_string().contains("destination forbidden"));

    // The session was discarded, so publishing needs a reconnect first.
    assert!(matches!(
        adapter.publish("tenant_added", &Headers::default(), b"{}").await,
        Err(PublishError::Connection(_))
    ));
}

#[tokio::test]
async fn refused_connection_is_reported() {
    let (listener, config) = listen().await;
    drop(listener);

    let adapter = StompAdapter::new(config);
    assert!(matches!(
        adapter.connect().await,
        Err(PublishError::Connection(_))
    ));
}

#[tokio::test]
async fn monitor_subscribes_and_normalizes_messages() {
    let (listener, config) = listen().await;
    let broker = tokio::spawn(async move {
        let (mut framed, _) = accept(&listener).await;
        let subscribe = framed.next().await.unwrap().unwrap();
        framed
            .send(
                StompFrame::new("MESSAGE")
                    .header("destination", "/topic/tenant.added")
                    .header("message-id", "1")
                    .header("subscription", "sub-0")
                    .header("x-correlation-id", "cid-1")
                    .body(br#"{"id":"t1"}"#.to_vec()),
            )
            .await
            .unwrap();
        // Keep the session open until the monitor is done.
        let _ = framed.next().await;
        subscribe
    });

    let (signal_tx, mut events) = mpsc::channel(4);
    let monitor = EventMonitor::spawn(
        StompMonitor::new(config),
        vec!["tenant_added".into()],
        signal_tx,
    );

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "tenant.added");
    assert_eq!(event.correlation_id, "cid-1");
    assert_eq!(event.raw_token, "");
    assert_eq!(event.payload, br#"{"id":"t1"}"#);
    assert_eq!(monitor.state(), MonitorState::Subscribed);

    let stats = monitor.shutdown().await;
    assert_eq!(stats.received, 1);

    let subscribe = broker.await.unwrap();
    assert_eq!(subscribe.command, "SUBSCRIBE");
    assert_eq!(subscribe.get("destination"), Some("/topic/tenant.added"));
    assert_eq!(subscribe.get("ack"), Some("auto"));
}

#[tokio::test]
async fn silent_broker_ends_the_session() {
    let (listener, config) = listen().await;
    let broker = tokio::spawn(async move {
        let connected = StompFrame::new("CONNECTED")
            .header("version", "1.2")
            .header("heart-beat", "100,0");
        let (mut framed, _) = accept_with(&listener, connected).await;
        let _subscribe = framed.next().await;
        // Half-open: hold the socket but never write again.
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(framed);
    });

    let (signal_tx, _events) = mpsc::channel(4);
    let monitor = EventMonitor::with_config(
        StompMonitor::new(heartbeat_config(config)),
        vec!["tenant_added".into()],
        signal_tx,
        MonitorConfig::default().with_reconnect_delay(Duration::from_secs(30)),
    );

    // Idle limit is three 100ms intervals.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(monitor.state(), MonitorState::Disconnected);

    let stats = monitor.shutdown().await;
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.disconnects, 1);
    broker.abort();
}

#[tokio::test]
async fn heartbeats_keep_a_quiet_session_alive() {
    let (listener, config) = listen().await;
    let broker = tokio::spawn(async move {
        let connected = StompFrame::new("CONNECTED")
            .header("version", "1.2")
            .header("heart-beat", "100,0");
        let (mut framed, _) = accept_with(&listener, connected).await;
        let _subscribe = framed.next().await;

        for _ in 0..12 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            framed.get_mut().write_all(b"\n").await.unwrap();
        }
        framed
            .send(
                StompFrame::new("MESSAGE")
                    .header("destination", "/topic/tenant.added")
                    .header("message-id", "1")
                    .body(br#"{"id":"t1"}"#.to_vec()),
            )
            .await
            .unwrap();
        let _ = framed.next().await;
    });

    let (signal_tx, mut events) = mpsc::channel(4);
    let monitor = EventMonitor::with_config(
        StompMonitor::new(heartbeat_config(config)),
        vec!["tenant_added".into()],
        signal_tx,
        MonitorConfig::default().with_reconnect_delay(Duration::from_secs(30)),
    );

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "tenant.added");
    assert_eq!(monitor.state(), MonitorState::Subscribed);

    let stats = monitor.shutdown().await;
    assert_eq!(stats.disconnects, 0);
    broker.abort();
}
