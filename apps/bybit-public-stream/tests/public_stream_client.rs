//! Public Stream Client Integration Tests
//!
//! Runs the client against a local WebSocket server that answers subscribe
//! requests the way Bybit's public stream does.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use bybit_public_stream::{
    FrameSink, PublicStreamClient, PublicStreamClientConfig, SendError, StreamError, StreamEvent,
    TickerKey, TickerResponse, TickerService, TopicDispatcher,
};

const WAIT: Duration = Duration::from_secs(5);

/// Frame observed by the server, tagged with its connection number.
type Observed = (usize, String);

fn ticker_snapshot(symbol: &str, last_price: &str) -> String {
    json!({
        "topic": format!("ticker.{symbol}"),
        "type": "snapshot",
        "ts": 1_673_272_861_686_i64,
        "cs": 24_987_956_059_i64,
        "data": { "symbol": symbol, "lastPrice": last_price },
    })
    .to_string()
}

/// Local stand-in for the public stream.
///
/// Acknowledges subscribe requests, rejects topics containing `BAD`, and
/// answers every accepted topic with one ticker snapshot. When
/// `drop_first` is set the first connection is closed after its first
/// subscribe.
async fn spawn_server(drop_first: bool) -> (SocketAddr, mpsc::UnboundedReceiver<Observed>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut session = 0usize;
        while let Ok((tcp, _)) = listener.accept().await {
            let this_session = session;
            session += 1;
            let tx = tx.clone();

            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else {
                        continue;
                    };
                    let text = text.to_string();
                    let _ = tx.send((this_session, text.clone()));

                    let request: Value = serde_json::from_str(&text).unwrap();
                    if request["op"] != "subscribe" {
                        continue;
                    }

                    let topics: Vec<String> = request["args"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .filter_map(|t| t.as_str().map(str::to_string))
                        .collect();

                    if topics.iter().any(|t| t.contains("BAD")) {
                        let nack = json!({
                            "success": false,
                            "ret_msg": format!("Invalid symbol :[{}]", topics.join(",")),
                            "conn_id": "local",
                            "op": "subscribe",
                        });
                        ws.send(Message::Text(nack.to_string().into())).await.unwrap();
                        continue;
                    }

                    let ack = json!({
                        "success": true,
                        "ret_msg": "",
                        "conn_id": "local",
                        "op": "subscribe",
                    });
                    ws.send(Message::Text(ack.to_string().into())).await.unwrap();

                    for topic in &topics {
                        let symbol = topic.trim_start_matches("ticker.");
                        let snapshot = ticker_snapshot(symbol, "17216.00");
                        ws.send(Message::Text(snapshot.into())).await.unwrap();
                    }

                    if drop_first && this_session == 0 {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            });
        }
    });

    (addr, rx)
}

fn client_for(
    addr: SocketAddr,
) -> (
    Arc<PublicStreamClient>,
    Arc<TickerService>,
    mpsc::Receiver<StreamEvent>,
    CancellationToken,
) {
    let mut config = PublicStreamClientConfig::new(format!("ws://{addr}"));
    config.reconnect.initial_delay = Duration::from_millis(20);
    config.reconnect.jitter_factor = 0.0;

    let (event_tx, event_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let client = Arc::new(PublicStreamClient::new(config, event_tx, cancel.clone()));

    let sink: Arc<dyn FrameSink> = Arc::clone(&client) as Arc<dyn FrameSink>;
    let service = Arc::new(TickerService::new(sink));
    client.register_dispatcher(Arc::clone(&service) as Arc<dyn TopicDispatcher>);

    (client, service, event_rx, cancel)
}

fn forwarding() -> (
    mpsc::UnboundedReceiver<TickerResponse>,
    impl Fn(TickerResponse) -> anyhow::Result<()> + Send + Sync + 'static,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (rx, move |msg: TickerResponse| -> anyhow::Result<()> {
        let _ = tx.send(msg);
        Ok(())
    })
}

async fn next_event(events: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

async fn wait_for_connected(events: &mut mpsc::Receiver<StreamEvent>) {
    loop {
        if next_event(events).await == StreamEvent::Connected {
            return;
        }
    }
}

#[tokio::test]
async fn test_offline_subscription_is_restored_on_connect_and_reconnect() {
    let (addr, mut observed) = spawn_server(true).await;
    let (client, service, mut events, _cancel) = client_for(addr);
    let (mut messages, handler) = forwarding();

    // Not connected yet: the request fails but the registration stays
    let err = service
        .subscribe(TickerKey::new("BTCUSDT"), handler)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Send(SendError::NotConnected)));

    let run = tokio::spawn(Arc::clone(&client).run());

    let (session, frame) = timeout(WAIT, observed.recv()).await.unwrap().unwrap();
    assert_eq!(session, 0);
    assert_eq!(frame, r#"{"op":"subscribe","args":["ticker.BTCUSDT"]}"#);

    let first = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(first.topic, "ticker.BTCUSDT");
    assert_eq!(first.data.last_price, "17216.00");

    // Server dropped the first connection; the topic is restored on the next
    let (session, frame) = timeout(WAIT, observed.recv()).await.unwrap().unwrap();
    assert_eq!(session, 1);
    assert_eq!(frame, r#"{"op":"subscribe","args":["ticker.BTCUSDT"]}"#);

    let second = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(second.key(), Some(TickerKey::new("BTCUSDT")));

    let mut saw_reconnect = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        if matches!(event, StreamEvent::Reconnecting { .. }) {
            saw_reconnect = true;
        }
    }
    assert!(saw_reconnect);

    client.close().await;
    let result = timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_live_subscribe_and_unsubscribe_reach_server() {
    let (addr, mut observed) = spawn_server(false).await;
    let (client, service, mut events, _cancel) = client_for(addr);
    let (mut messages, handler) = forwarding();

    let run = tokio::spawn(Arc::clone(&client).run());
    wait_for_connected(&mut events).await;
    assert!(client.is_connected());

    let handle = service
        .subscribe(TickerKey::new("ETHUSDT"), handler)
        .await
        .unwrap();

    let (_, frame) = timeout(WAIT, observed.recv()).await.unwrap().unwrap();
    assert_eq!(frame, r#"{"op":"subscribe","args":["ticker.ETHUSDT"]}"#);

    let msg = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(msg.data.symbol, "ETHUSDT");
    assert_eq!(msg.cross_sequence, Some(24_987_956_059));

    handle.unsubscribe().await.unwrap();
    let (_, frame) = timeout(WAIT, observed.recv()).await.unwrap().unwrap();
    assert_eq!(frame, r#"{"op":"unsubscribe","args":["ticker.ETHUSDT"]}"#);
    assert!(!service.is_subscribed(&TickerKey::new("ETHUSDT")));

    client.close().await;
    assert!(!client.is_connected());
    assert!(timeout(WAIT, run).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn test_rejected_subscribe_is_reported_as_event() {
    let (addr, _observed) = spawn_server(false).await;
    let (client, service, mut events, _cancel) = client_for(addr);
    let (_messages, handler) = forwarding();

    let run = tokio::spawn(Arc::clone(&client).run());
    wait_for_connected(&mut events).await;

    service
        .subscribe(TickerKey::new("BADUSDT"), handler)
        .await
        .unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(
        event,
        StreamEvent::OperationRejected {
            op: "subscribe".to_string(),
            message: "Invalid symbol :[ticker.BADUSDT]".to_string(),
        }
    );

    client.close().await;
    assert!(timeout(WAIT, run).await.unwrap().unwrap().is_ok());
}

#[tokio::test]
async fn test_restore_batches_topics() {
    let (addr, mut observed) = spawn_server(false).await;
    let (client, service, _events, _cancel) = client_for(addr);

    for i in 0..12 {
        let (_rx, handler) = forwarding();
        let key = TickerKey::new(format!("SYM{i:02}USDT"));
        // Offline: registrations are kept for the restore
        let _ = service.subscribe(key, handler).await;
    }

    let run = tokio::spawn(Arc::clone(&client).run());

    let (_, first) = timeout(WAIT, observed.recv()).await.unwrap().unwrap();
    let (_, second) = timeout(WAIT, observed.recv()).await.unwrap().unwrap();

    let first: Value = serde_json::from_str(&first).unwrap();
    let second: Value = serde_json::from_str(&second).unwrap();
    assert_eq!(first["op"], "subscribe");
    assert_eq!(first["args"].as_array().unwrap().len(), 10);
    assert_eq!(second["args"].as_array().unwrap().len(), 2);
    assert_eq!(first["args"][0], "ticker.SYM00USDT");
    assert_eq!(second["args"][1], "ticker.SYM11USDT");
    assert_eq!(service.active_topics().len(), 12);

    client.close().await;
    assert!(timeout(WAIT, run).await.unwrap().unwrap().is_ok());
}
