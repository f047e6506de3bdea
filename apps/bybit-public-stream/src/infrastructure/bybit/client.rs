//! Public Stream WebSocket Client
//!
//! Connects to Bybit's V5 public stream and carries every registered stream
//! family over one connection.
//!
//! # Stream URL
//!
//! - Mainnet: `wss://stream.bybit.com/v5/public/{category}`
//! - Testnet: `wss://stream-testnet.bybit.com/v5/public/{category}`
//!
//! # Lifecycle
//!
//! On every (re)connect the client restores the active topics of all
//! registered dispatchers in batched subscribe requests, starts the
//! heartbeat, and then routes inbound text frames: topic messages go to the
//! dispatchers, operation acknowledgements are logged and rejections
//! surfaced as events. Connection failures are retried with exponential
//! backoff until the cancellation token fires or attempts run out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, InboundFrame, JsonCodec};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::{Operation, OperationRequest, OperationResponse};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{FrameSink, SendError, TopicDispatcher};
use crate::infrastructure::config::StreamConfig;
use crate::infrastructure::metrics;

/// Maximum topics per subscribe request accepted by the spot stream.
pub const MAX_ARGS_PER_REQUEST: usize = 10;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the public stream client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Request encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Request could not be written.
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// Ping went unanswered.
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(Duration),

    /// Heartbeat task exited while the connection was still open.
    #[error("heartbeat task stopped")]
    HeartbeatStopped,

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,

    /// Connection closed by the server or the network.
    #[error("connection closed")]
    ConnectionClosed,
}

// =============================================================================
// Client Events
// =============================================================================

/// Events emitted by the public stream client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Connected; subscriptions are being restored.
    Connected,
    /// Disconnected from server.
    Disconnected,
    /// Reconnecting to server.
    Reconnecting {
        /// Reconnection attempt number.
        attempt: u32,
    },
    /// Server rejected an operation request.
    OperationRejected {
        /// Rejected operation.
        op: String,
        /// Server message.
        message: String,
    },
    /// A dispatcher failed to handle a topic message.
    DispatchFailed {
        /// Family tag of the failing dispatcher.
        family: &'static str,
        /// Error description.
        error: String,
    },
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for the public stream client.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicStreamClientConfig {
    /// WebSocket URL.
    pub url: String,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
}

impl PublicStreamClientConfig {
    /// Create a configuration with default timing.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl From<&StreamConfig> for PublicStreamClientConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            url: config.stream_url(),
            reconnect: ReconnectConfig::from(&config.websocket),
            heartbeat: HeartbeatConfig::from(&config.websocket),
        }
    }
}

// =============================================================================
// Public Stream Client
// =============================================================================

/// WebSocket client for Bybit's public streams.
///
/// Manages the connection lifecycle including:
/// - Subscription restore on every (re)connect
/// - Heartbeat monitoring
/// - Automatic reconnection with exponential backoff
/// - Routing of inbound frames to registered dispatchers
pub struct PublicStreamClient {
    config: PublicStreamClientConfig,
    codec: JsonCodec,
    event_tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    writer: Mutex<Option<WsWriter>>,
    connected: AtomicBool,
    heartbeat: Arc<HeartbeatState>,
    dispatchers: RwLock<Vec<Arc<dyn TopicDispatcher>>>,
}

impl std::fmt::Debug for PublicStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicStreamClient")
            .field("url", &self.config.url)
            .field("connected", &self.is_connected())
            .field("dispatchers", &self.dispatchers.read().len())
            .finish_non_exhaustive()
    }
}

impl PublicStreamClient {
    /// Create a new client.
    #[must_use]
    pub fn new(
        config: PublicStreamClientConfig,
        event_tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            codec: JsonCodec::new(),
            event_tx,
            cancel,
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            heartbeat: Arc::new(HeartbeatState::new()),
            dispatchers: RwLock::new(Vec::new()),
        }
    }

    /// Route inbound frames to `dispatcher` and restore its topics on reconnect.
    pub fn register_dispatcher(&self, dispatcher: Arc<dyn TopicDispatcher>) {
        tracing::debug!(family = dispatcher.family(), "Registered dispatcher");
        self.dispatchers.write().push(dispatcher);
    }

    /// Check if a connection is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Run the connection loop.
    ///
    /// Returns `Ok(())` once cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::MaxReconnectAttemptsExceeded`] when the
    /// reconnection policy gives up.
    pub async fn run(self: Arc<Self>) -> Result<(), ClientError> {
        let mut reconnect_policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Public stream client cancelled");
                return Ok(());
            }

            match self.connect_and_run(&mut reconnect_policy).await {
                Ok(()) => {
                    tracing::info!("Public stream connection closed gracefully");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Public stream connection error");
                    let _ = self.event_tx.send(StreamEvent::Disconnected).await;

                    let Some(delay) = reconnect_policy.next_delay() else {
                        return Err(ClientError::MaxReconnectAttemptsExceeded);
                    };

                    let attempt = reconnect_policy.attempt_count();
                    tracing::info!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Reconnecting to public stream"
                    );
                    metrics::record_reconnect();
                    let _ = self
                        .event_tx
                        .send(StreamEvent::Reconnecting { attempt })
                        .await;

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::info!("Public stream client cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Cancel the run loop and close the connection.
    pub async fn close(&self) {
        self.cancel.cancel();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                tracing::debug!(error = %e, "Error closing WebSocket");
            }
        }
        self.set_connected(false);
    }

    /// Connect and process frames until an error or cancellation.
    async fn connect_and_run(&self, policy: &mut ReconnectPolicy) -> Result<(), ClientError> {
        tracing::info!(url = %self.config.url, "Connecting to public stream");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(&self.config.url).await?;
        let (write, read) = ws_stream.split();

        *self.writer.lock().await = Some(write);
        self.set_connected(true);
        self.heartbeat.reset();
        policy.reset();

        tracing::info!("Public stream connected");
        let _ = self.event_tx.send(StreamEvent::Connected).await;

        let heartbeat_cancel = self.cancel.child_token();
        let result = self.process_frames(read, heartbeat_cancel.clone()).await;

        heartbeat_cancel.cancel();
        self.writer.lock().await.take();
        self.set_connected(false);

        result
    }

    /// Restore subscriptions, start the heartbeat and read until failure.
    async fn process_frames(
        &self,
        mut read: WsReader,
        heartbeat_cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        self.restore_subscriptions().await?;

        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(4);
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat.clone(),
                Arc::clone(&self.heartbeat),
                heartbeat_tx,
                heartbeat_cancel,
            )
            .run(),
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                event = heartbeat_rx.recv() => self.handle_heartbeat(event).await?,
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text_message(&text).await,
                    Some(Ok(Message::Ping(data))) => self.write_message(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(frame = ?frame, "Server sent close frame");
                        return Err(ClientError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        tracing::info!("WebSocket stream ended");
                        return Err(ClientError::ConnectionClosed);
                    }
                },
            }
        }
    }

    /// Resubscribe every active topic in batched requests.
    async fn restore_subscriptions(&self) -> Result<(), ClientError> {
        let topics = self.active_topics();
        if topics.is_empty() {
            return Ok(());
        }

        tracing::info!(count = topics.len(), "Restoring subscriptions");

        for batch in topics.chunks(MAX_ARGS_PER_REQUEST) {
            let frame = self
                .codec
                .encode_request(&OperationRequest::subscribe(batch.to_vec()))?;
            self.send_frame(frame).await?;
            metrics::record_request_sent(Operation::Subscribe);
        }

        Ok(())
    }

    /// React to a heartbeat event. A closed channel ends the connection so
    /// the select loop never polls a finished receiver.
    async fn handle_heartbeat(&self, event: Option<HeartbeatEvent>) -> Result<(), ClientError> {
        match event {
            Some(HeartbeatEvent::SendPing) => self.send_ping().await,
            Some(HeartbeatEvent::Timeout { elapsed }) => Err(ClientError::HeartbeatTimeout(elapsed)),
            None => {
                tracing::warn!("Heartbeat channel closed");
                Err(ClientError::HeartbeatStopped)
            }
        }
    }

    async fn send_ping(&self) -> Result<(), ClientError> {
        let frame = self.codec.encode_request(&OperationRequest::ping())?;
        self.heartbeat.mark_ping_sent();
        self.send_frame(frame).await?;
        metrics::record_request_sent(Operation::Ping);
        Ok(())
    }

    /// Handle a text frame from the WebSocket.
    async fn handle_text_message(&self, text: &str) {
        metrics::record_frame_received();

        match self.codec.decode(text) {
            Ok(InboundFrame::Topic { topic, value }) => {
                let dispatchers = self.dispatchers.read().clone();

                for dispatcher in dispatchers {
                    if let Err(e) = dispatcher.dispatch_value(&topic, &value) {
                        tracing::warn!(
                            family = dispatcher.family(),
                            topic = %topic,
                            error = %e,
                            "Dispatch failed"
                        );
                        let _ = self
                            .event_tx
                            .send(StreamEvent::DispatchFailed {
                                family: dispatcher.family(),
                                error: e.to_string(),
                            })
                            .await;
                    }
                }
            }
            Ok(InboundFrame::Operation(ack)) => self.handle_operation_response(ack).await,
            Ok(InboundFrame::Unclassified(value)) => {
                tracing::trace!(frame = %value, "Ignoring unclassified frame");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to decode frame");
            }
        }
    }

    async fn handle_operation_response(&self, ack: OperationResponse) {
        if ack.is_pong() {
            self.heartbeat.record_pong();
            tracing::trace!(conn_id = %ack.conn_id, "Pong received");
            return;
        }

        let op = ack.op.map_or("unknown", Operation::as_str);

        if ack.is_success() {
            tracing::debug!(op, conn_id = %ack.conn_id, "Operation acknowledged");
            return;
        }

        tracing::warn!(op, message = %ack.ret_msg, "Operation rejected");
        metrics::record_operation_rejected(op);
        let _ = self
            .event_tx
            .send(StreamEvent::OperationRejected {
                op: op.to_string(),
                message: ack.ret_msg,
            })
            .await;
    }

    async fn write_message(&self, message: Message) -> Result<(), SendError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SendError::NotConnected)?;

        writer.send(message).await.map_err(|e| SendError::Transport {
            message: e.to_string(),
        })
    }

    fn active_topics(&self) -> Vec<String> {
        self.dispatchers
            .read()
            .iter()
            .flat_map(|d| d.active_topics())
            .collect()
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        metrics::set_connected(connected);
    }
}

#[async_trait]
impl FrameSink for PublicStreamClient {
    async fn send_frame(&self, frame: String) -> Result<(), SendError> {
        self.write_message(Message::Text(frame.into())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockFrameSink;
    use crate::application::services::TickerService;
    use crate::domain::ticker::{TickerKey, TickerResponse};

    const BTC_SNAPSHOT: &str = r#"{"topic":"ticker.BTCUSDT","type":"snapshot","ts":1673272861686,"data":{"symbol":"BTCUSDT","lastPrice":"17216.00"}}"#;

    fn client() -> (Arc<PublicStreamClient>, mpsc::Receiver<StreamEvent>) {
        let (event_tx, event_rx) = mpsc::channel(16);
        let client = PublicStreamClient::new(
            PublicStreamClientConfig::new("ws://127.0.0.1:1"),
            event_tx,
            CancellationToken::new(),
        );
        (Arc::new(client), event_rx)
    }

    fn accepting_sink() -> Arc<dyn FrameSink> {
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame().returning(|_| Ok(()));
        Arc::new(sink)
    }

    #[test]
    fn config_from_stream_config() {
        let config = PublicStreamClientConfig::from(&StreamConfig::default());

        assert_eq!(config.url, "wss://stream.bybit.com/v5/public/linear");
        assert_eq!(config.heartbeat.ping_interval, Duration::from_secs(20));
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn send_while_disconnected_fails() {
        let (client, _events) = client();

        assert!(!client.is_connected());
        assert_eq!(
            client.send_frame(r#"{"op":"ping"}"#.to_string()).await,
            Err(SendError::NotConnected)
        );
    }

    #[tokio::test]
    async fn text_frames_reach_registered_dispatcher() {
        let (client, _events) = client();
        let service = Arc::new(TickerService::new(accepting_sink()));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let recorder = Arc::clone(&seen);
        let _handle = service
            .subscribe(TickerKey::new("BTCUSDT"), move |msg: TickerResponse| {
                recorder.lock().push(msg.data.last_price);
                Ok(())
            })
            .await
            .unwrap();

        client.register_dispatcher(service.clone());
        client.handle_text_message(BTC_SNAPSHOT).await;

        assert_eq!(*seen.lock(), vec!["17216.00".to_string()]);
        assert_eq!(client.active_topics(), vec!["ticker.BTCUSDT"]);
    }

    #[tokio::test]
    async fn handler_failure_becomes_event() {
        let (client, mut events) = client();
        let service = Arc::new(TickerService::new(accepting_sink()));

        let _handle = service
            .subscribe(TickerKey::new("BTCUSDT"), |_msg: TickerResponse| {
                anyhow::bail!("storage offline")
            })
            .await
            .unwrap();

        client.register_dispatcher(service);
        client.handle_text_message(BTC_SNAPSHOT).await;

        match events.try_recv().unwrap() {
            StreamEvent::DispatchFailed { family, error } => {
                assert_eq!(family, "ticker");
                assert!(error.contains("storage offline"));
            }
            other => panic!("expected DispatchFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_operation_becomes_event() {
        let (client, mut events) = client();

        client
            .handle_text_message(
                r#"{"success":false,"ret_msg":"error:handler not found,topic:ticker.NOPE","conn_id":"c1","op":"subscribe"}"#,
            )
            .await;

        assert_eq!(
            events.try_recv().unwrap(),
            StreamEvent::OperationRejected {
                op: "subscribe".to_string(),
                message: "error:handler not found,topic:ticker.NOPE".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn pong_clears_outstanding_ping() {
        let (client, mut events) = client();
        client.heartbeat.mark_ping_sent();

        client
            .handle_text_message(r#"{"success":true,"ret_msg":"pong","conn_id":"c1","op":"ping"}"#)
            .await;

        assert!(client.heartbeat.outstanding_for().is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_heartbeat_channel_ends_connection() {
        let (client, _events) = client();

        let result = client.handle_heartbeat(None).await;

        assert!(matches!(result, Err(ClientError::HeartbeatStopped)));
    }

    #[tokio::test]
    async fn heartbeat_timeout_is_reported() {
        let (client, _events) = client();

        let result = client
            .handle_heartbeat(Some(HeartbeatEvent::Timeout {
                elapsed: Duration::from_secs(11),
            }))
            .await;

        assert!(matches!(
            result,
            Err(ClientError::HeartbeatTimeout(elapsed)) if elapsed == Duration::from_secs(11)
        ));
    }

    #[tokio::test]
    async fn garbage_frames_are_ignored() {
        let (client, mut events) = client();

        client.handle_text_message("not json").await;
        client.handle_text_message(r#"{"hello":"world"}"#).await;

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_cancels_run_loop() {
        let (client, _events) = client();

        client.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), Arc::clone(&client).run()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
