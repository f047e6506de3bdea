//! Application Services
//!
//! Per-family stream facade combining the subscription registry, the request
//! codec and the connection's frame sink.
//!
//! # Design
//!
//! Subscribing registers the handler first and sends the request second.
//! A duplicate key therefore fails before anything reaches the wire, and a
//! failed send leaves the registration in place: the connection restores it
//! on the next (re)connect, and the caller can release it with
//! [`StreamService::unsubscribe`].
//!
//! Unsubscribing always removes the registration, even when the request
//! cannot be sent. An [`Unsubscribe`] handle only ever releases the
//! registration it was issued for; once that registration is gone the handle
//! neither sends nor removes anything.
//!
//! Dispatch derives the key from the topic, decodes the payload and only then
//! looks up the handler. Frames of other families are never decoded, while a
//! malformed payload of this family is an error whether or not anyone is
//! subscribed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde_json::Value;

use crate::application::ports::{FrameSink, TopicDispatcher};
use crate::domain::subscription::{SharedHandler, SubscriptionId, SubscriptionRegistry};
use crate::domain::ticker::Ticker;
use crate::domain::topic::{StreamFamily, TopicKey};
use crate::error::StreamError;
use crate::infrastructure::bybit::codec::{InboundFrame, JsonCodec};
use crate::infrastructure::bybit::messages::Operation;
use crate::infrastructure::metrics;

/// Facade for the `ticker` stream family.
pub type TickerService = StreamService<Ticker>;

// =============================================================================
// Stream Service
// =============================================================================

/// Subscription facade for one stream family on one connection.
pub struct StreamService<F: StreamFamily> {
    registry: Arc<SubscriptionRegistry<F>>,
    sink: Arc<dyn FrameSink>,
    codec: JsonCodec,
}

impl<F: StreamFamily> fmt::Debug for StreamService<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamService")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<F: StreamFamily> StreamService<F> {
    /// Create a facade sending requests through `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            registry: Arc::new(SubscriptionRegistry::new()),
            sink,
            codec: JsonCodec::new(),
        }
    }

    /// Subscribe `handler` to the stream identified by `key`.
    ///
    /// # Errors
    ///
    /// See [`StreamService::subscribe_handler`].
    pub async fn subscribe<H>(&self, key: F::Key, handler: H) -> Result<Unsubscribe<F>, StreamError>
    where
        H: Fn(F::Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(key, Arc::new(handler)).await
    }

    /// Subscribe an already-shared handler to the stream identified by `key`.
    ///
    /// # Errors
    ///
    /// - [`StreamError::Registry`] if `key` is already subscribed; nothing is sent.
    /// - [`StreamError::Codec`] or [`StreamError::Send`] if the request could
    ///   not be delivered; the registration is kept.
    pub async fn subscribe_handler(
        &self,
        key: F::Key,
        handler: SharedHandler<F::Payload>,
    ) -> Result<Unsubscribe<F>, StreamError> {
        let topic = key.topic();

        let id = self.registry.register(key.clone(), handler)?;
        metrics::set_active_subscriptions(F::TAG, self.registry.len());
        tracing::debug!(family = F::TAG, topic = %topic, "Registered subscription");

        let sent = send_operation(&self.codec, self.sink.as_ref(), Operation::Subscribe, topic).await;
        if let Err(e) = sent {
            tracing::warn!(
                family = F::TAG,
                key = ?key,
                error = %e,
                "Subscribe request not delivered, registration kept"
            );
            return Err(e);
        }

        Ok(Unsubscribe {
            key,
            id,
            registry: Arc::clone(&self.registry),
            sink: Arc::clone(&self.sink),
            codec: self.codec,
            released: AtomicBool::new(false),
        })
    }

    /// Send the unsubscribe request for `key` and remove its registration.
    ///
    /// The registration is removed even if sending fails. Unknown keys are
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns the encode or send error, if any.
    pub async fn unsubscribe(&self, key: &F::Key) -> Result<(), StreamError> {
        release(&self.registry, self.sink.as_ref(), &self.codec, key).await
    }

    /// Route one raw inbound frame to its handler.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Codec`] for unparseable frames or payloads, and
    /// [`StreamError::Handler`] if the handler fails.
    pub fn dispatch(&self, raw: &str) -> Result<(), StreamError> {
        match self.codec.decode(raw)? {
            InboundFrame::Topic { topic, value } => self.dispatch_topic(&topic, &value),
            InboundFrame::Operation(_) | InboundFrame::Unclassified(_) => Ok(()),
        }
    }

    fn dispatch_topic(&self, topic: &str, value: &Value) -> Result<(), StreamError> {
        let Some(key) = F::Key::from_topic(topic) else {
            tracing::trace!(family = F::TAG, topic, "Topic not in family, skipping");
            return Ok(());
        };

        let started = Instant::now();
        let payload: F::Payload = self.codec.decode_payload(value)?;

        let handler = match self.registry.resolve(&key) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::trace!(family = F::TAG, error = %e, "Dropping unmatched message");
                metrics::record_unmatched(F::TAG);
                return Ok(());
            }
        };

        if let Err(e) = handler.handle(payload) {
            metrics::record_handler_failure(F::TAG);
            return Err(StreamError::Handler(e));
        }

        metrics::record_dispatched(F::TAG, started.elapsed());
        Ok(())
    }

    /// Check if `key` has a live registration.
    #[must_use]
    pub fn is_subscribed(&self, key: &F::Key) -> bool {
        self.registry.contains(key)
    }

    /// Shared registry backing this facade.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry<F>> {
        &self.registry
    }
}

impl<F: StreamFamily> TopicDispatcher for StreamService<F> {
    fn family(&self) -> &'static str {
        F::TAG
    }

    fn dispatch(&self, raw: &str) -> Result<(), StreamError> {
        Self::dispatch(self, raw)
    }

    fn dispatch_value(&self, topic: &str, value: &Value) -> Result<(), StreamError> {
        self.dispatch_topic(topic, value)
    }

    fn active_topics(&self) -> Vec<String> {
        self.registry.topics()
    }
}

// =============================================================================
// Unsubscribe Handle
// =============================================================================

/// Handle returned by a successful subscribe.
///
/// The first call to [`Unsubscribe::unsubscribe`] sends the inverse request
/// and removes the registration, provided it is still the one this handle
/// was issued for. Later calls, and calls after the key was released some
/// other way, do nothing, so a stale handle cannot touch a newer
/// subscription for the same key.
pub struct Unsubscribe<F: StreamFamily> {
    key: F::Key,
    id: SubscriptionId,
    registry: Arc<SubscriptionRegistry<F>>,
    sink: Arc<dyn FrameSink>,
    codec: JsonCodec,
    released: AtomicBool,
}

impl<F: StreamFamily> fmt::Debug for Unsubscribe<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("key", &self.key)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

impl<F: StreamFamily> Unsubscribe<F> {
    /// Key this handle releases.
    #[must_use]
    pub const fn key(&self) -> &F::Key {
        &self.key
    }

    /// Check if the handle has already been used.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Send the unsubscribe request and remove the registration.
    ///
    /// # Errors
    ///
    /// Returns the encode or send error of the first call. The registration
    /// is removed regardless.
    pub async fn unsubscribe(&self) -> Result<(), StreamError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if !self.registry.is_current(&self.key, self.id) {
            tracing::debug!(family = F::TAG, key = ?self.key, "Registration already released");
            return Ok(());
        }

        let sent = send_operation(
            &self.codec,
            self.sink.as_ref(),
            Operation::Unsubscribe,
            self.key.topic(),
        )
        .await;

        let removed = self.registry.unregister_id(&self.key, self.id);
        metrics::set_active_subscriptions(F::TAG, self.registry.len());
        tracing::debug!(family = F::TAG, key = ?self.key, removed, "Released subscription");

        sent
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn send_operation(
    codec: &JsonCodec,
    sink: &dyn FrameSink,
    op: Operation,
    topic: String,
) -> Result<(), StreamError> {
    let frame = codec.build_request(op, vec![topic])?;
    tracing::debug!(%op, frame = %frame, "Sending request");

    sink.send_frame(frame).await?;
    metrics::record_request_sent(op);
    Ok(())
}

async fn release<F: StreamFamily>(
    registry: &SubscriptionRegistry<F>,
    sink: &dyn FrameSink,
    codec: &JsonCodec,
    key: &F::Key,
) -> Result<(), StreamError> {
    let sent = send_operation(codec, sink, Operation::Unsubscribe, key.topic()).await;

    let removed = registry.unregister(key);
    metrics::set_active_subscriptions(F::TAG, registry.len());
    tracing::debug!(family = F::TAG, key = ?key, removed, "Released subscription");

    sent
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{MockFrameSink, SendError};
    use crate::domain::subscription::RegistryError;
    use crate::domain::ticker::{TickerKey, TickerResponse};
    use mockall::predicate::eq;
    use parking_lot::Mutex;

    const BTC_SNAPSHOT: &str = r#"{"topic":"ticker.BTCUSDT","type":"snapshot","ts":1673272861686,"cs":24987956059,"data":{"symbol":"BTCUSDT","lastPrice":"17216.00","bid1Price":"17215.50","ask1Price":"17216.00"}}"#;

    fn accepting_sink() -> Arc<dyn FrameSink> {
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame().returning(|_| Ok(()));
        Arc::new(sink)
    }

    fn collecting() -> (
        Arc<Mutex<Vec<TickerResponse>>>,
        impl Fn(TickerResponse) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |msg: TickerResponse| -> anyhow::Result<()> {
            sink.lock().push(msg);
            Ok(())
        })
    }

    #[tokio::test]
    async fn subscribe_sends_exact_request() {
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame()
            .with(eq(r#"{"op":"subscribe","args":["ticker.BTCUSDT"]}"#.to_string()))
            .times(1)
            .returning(|_| Ok(()));

        let service = TickerService::new(Arc::new(sink));
        let (_, handler) = collecting();

        let handle = service
            .subscribe(TickerKey::new("BTCUSDT"), handler)
            .await
            .unwrap();

        assert_eq!(handle.key(), &TickerKey::new("BTCUSDT"));
        assert!(service.is_subscribed(&TickerKey::new("BTCUSDT")));
    }

    #[tokio::test]
    async fn duplicate_subscribe_sends_nothing() {
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame().times(1).returning(|_| Ok(()));

        let service = TickerService::new(Arc::new(sink));
        let (first_seen, first) = collecting();
        let (second_seen, second) = collecting();

        let _handle = service
            .subscribe(TickerKey::new("BTCUSDT"), first)
            .await
            .unwrap();
        let err = service
            .subscribe(TickerKey::new("BTCUSDT"), second)
            .await
            .unwrap_err();

        assert!(err.is_duplicate());

        service.dispatch(BTC_SNAPSHOT).unwrap();
        assert_eq!(first_seen.lock().len(), 1);
        assert!(second_seen.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_send_keeps_registration() {
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame()
            .returning(|_| Err(SendError::NotConnected));

        let service = TickerService::new(Arc::new(sink));
        let (_, handler) = collecting();

        let err = service
            .subscribe(TickerKey::new("BTCUSDT"), handler)
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::Send(SendError::NotConnected)));
        assert!(service.is_subscribed(&TickerKey::new("BTCUSDT")));
        assert_eq!(service.active_topics(), vec!["ticker.BTCUSDT"]);
    }

    #[tokio::test]
    async fn dispatch_invokes_handler_with_payload() {
        let service = TickerService::new(accepting_sink());
        let (seen, handler) = collecting();

        let _handle = service
            .subscribe(TickerKey::new("BTCUSDT"), handler)
            .await
            .unwrap();
        service.dispatch(BTC_SNAPSHOT).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic, "ticker.BTCUSDT");
        assert_eq!(seen[0].data.last_price, "17216.00");
    }

    #[tokio::test]
    async fn dispatch_drops_unmatched_topic() {
        let service = TickerService::new(accepting_sink());
        let (seen, handler) = collecting();

        let _handle = service
            .subscribe(TickerKey::new("ETHUSDT"), handler)
            .await
            .unwrap();

        service.dispatch(BTC_SNAPSHOT).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn dispatch_skips_foreign_and_ack_frames() {
        let service = TickerService::new(accepting_sink());

        service
            .dispatch(r#"{"topic":"orderbook.50.BTCUSDT","type":"snapshot","ts":1,"data":{}}"#)
            .unwrap();
        service
            .dispatch(r#"{"success":true,"ret_msg":"","conn_id":"abc","op":"subscribe"}"#)
            .unwrap();
        service.dispatch(r#"{"topic":"ticker"}"#).unwrap();
    }

    #[test]
    fn dispatch_rejects_invalid_json() {
        let service = TickerService::new(accepting_sink());
        let err = service.dispatch("not json").unwrap_err();
        assert_eq!(err.kind(), "codec");
    }

    #[tokio::test]
    async fn dispatch_returns_payload_decode_error() {
        let service = TickerService::new(accepting_sink());
        let (seen, handler) = collecting();

        let _handle = service
            .subscribe(TickerKey::new("BTCUSDT"), handler)
            .await
            .unwrap();

        let err = service
            .dispatch(r#"{"topic":"ticker.BTCUSDT","type":"snapshot","ts":"late","data":{}}"#)
            .unwrap_err();

        assert!(matches!(err, StreamError::Codec(_)));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn handler_error_is_dispatch_result() {
        let service = TickerService::new(accepting_sink());

        let _handle = service
            .subscribe(TickerKey::new("BTCUSDT"), |_msg: TickerResponse| {
                anyhow::bail!("rejected")
            })
            .await
            .unwrap();

        let err = service.dispatch(BTC_SNAPSHOT).unwrap_err();
        assert!(matches!(err, StreamError::Handler(_)));
        assert!(service.is_subscribed(&TickerKey::new("BTCUSDT")));
    }

    #[tokio::test]
    async fn unsubscribe_handle_sends_inverse_and_cleans_up() {
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame()
            .with(eq(r#"{"op":"subscribe","args":["ticker.BTCUSDT"]}"#.to_string()))
            .times(1)
            .returning(|_| Ok(()));
        sink.expect_send_frame()
            .with(eq(r#"{"op":"unsubscribe","args":["ticker.BTCUSDT"]}"#.to_string()))
            .times(1)
            .returning(|_| Ok(()));

        let service = TickerService::new(Arc::new(sink));
        let (seen, handler) = collecting();
        let key = TickerKey::new("BTCUSDT");

        let handle = service.subscribe(key.clone(), handler).await.unwrap();
        handle.unsubscribe().await.unwrap();

        assert!(handle.is_released());
        assert_eq!(
            service.registry().resolve(&key).err(),
            Some(RegistryError::HandlerNotFound {
                topic: "ticker.BTCUSDT".to_string()
            })
        );

        service.dispatch(BTC_SNAPSHOT).unwrap();
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_handle_is_single_use() {
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame().times(3).returning(|_| Ok(()));

        let service = TickerService::new(Arc::new(sink));
        let key = TickerKey::new("BTCUSDT");

        let (_, first) = collecting();
        let stale = service.subscribe(key.clone(), first).await.unwrap();
        stale.unsubscribe().await.unwrap();

        let (seen, second) = collecting();
        let _fresh = service.subscribe(key.clone(), second).await.unwrap();

        // No fourth send, and the fresh registration survives
        stale.unsubscribe().await.unwrap();
        assert!(service.is_subscribed(&key));

        service.dispatch(BTC_SNAPSHOT).unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn stale_handle_spares_resubscription_after_direct_unsubscribe() {
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame()
            .withf(|frame| frame.contains(r#""op":"subscribe""#))
            .times(2)
            .returning(|_| Ok(()));
        sink.expect_send_frame()
            .withf(|frame| frame.contains(r#""op":"unsubscribe""#))
            .times(1)
            .returning(|_| Ok(()));

        let service = TickerService::new(Arc::new(sink));
        let key = TickerKey::new("BTCUSDT");

        let (_, first) = collecting();
        let stale = service.subscribe(key.clone(), first).await.unwrap();
        service.unsubscribe(&key).await.unwrap();

        let (seen, second) = collecting();
        let fresh = service.subscribe(key.clone(), second).await.unwrap();

        // Neither sends an unsubscribe nor removes the fresh registration
        stale.unsubscribe().await.unwrap();
        assert!(stale.is_released());
        assert!(service.is_subscribed(&key));
        assert!(!fresh.is_released());

        service.dispatch(BTC_SNAPSHOT).unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn dispatch_rejects_malformed_payload_without_subscription() {
        let service = TickerService::new(accepting_sink());

        let err = service
            .dispatch(r#"{"topic":"ticker.BTCUSDT","type":"snapshot","ts":"late","data":{}}"#)
            .unwrap_err();

        assert!(matches!(err, StreamError::Codec(_)));
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_failure_still_unregisters() {
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame()
            .withf(|frame| frame.contains(r#""op":"subscribe""#))
            .times(1)
            .returning(|_| Ok(()));
        sink.expect_send_frame()
            .withf(|frame| frame.contains(r#""op":"unsubscribe""#))
            .times(1)
            .returning(|_| {
                Err(SendError::Transport {
                    message: "broken pipe".to_string(),
                })
            });

        let service = TickerService::new(Arc::new(sink));
        let (_, handler) = collecting();
        let key = TickerKey::new("BTCUSDT");

        let handle = service.subscribe(key.clone(), handler).await.unwrap();
        let err = handle.unsubscribe().await.unwrap_err();

        assert!(matches!(err, StreamError::Send(SendError::Transport { .. })));
        assert!(!service.is_subscribed(&key));
    }

    #[tokio::test]
    async fn direct_unsubscribe_releases_failed_subscription() {
        let mut sink = MockFrameSink::new();
        sink.expect_send_frame()
            .times(2)
            .returning(|_| Err(SendError::NotConnected));

        let service = TickerService::new(Arc::new(sink));
        let (_, handler) = collecting();
        let key = TickerKey::new("BTCUSDT");

        assert!(service.subscribe(key.clone(), handler).await.is_err());
        assert!(service.unsubscribe(&key).await.is_err());
        assert!(!service.is_subscribed(&key));
    }

    #[tokio::test]
    async fn handler_may_unsubscribe_from_callback() {
        let service = Arc::new(TickerService::new(accepting_sink()));
        let key = TickerKey::new("BTCUSDT");
        let inner = Arc::clone(&service);

        let _handle = service
            .subscribe(key.clone(), move |msg: TickerResponse| {
                // Registry lock is released before handlers run
                let key = msg.key().ok_or_else(|| anyhow::anyhow!("bad topic"))?;
                assert!(inner.registry().unregister(&key));
                Ok(())
            })
            .await
            .unwrap();

        service.dispatch(BTC_SNAPSHOT).unwrap();
        assert!(!service.is_subscribed(&key));
    }

    #[test]
    fn family_tag() {
        let service = TickerService::new(accepting_sink());
        assert_eq!(TopicDispatcher::family(&service), "ticker");
        assert!(service.active_topics().is_empty());
    }
}
