//! Ticker Stream Family
//!
//! Bybit V5 `tickers` stream: last traded price, 24h statistics, funding and
//! open interest, plus the best bid and ask.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! {
//!   "topic": "ticker.BTCUSDT",
//!   "type": "snapshot",
//!   "ts": 1672324988882,
//!   "cs": 24987956059,
//!   "data": {"symbol": "BTCUSDT", "lastPrice": "17216.00", "bid1Price": "17215.50", ...}
//! }
//! ```
//!
//! Prices and sizes arrive as decimal strings and are kept verbatim. The
//! `*_decimal` accessors parse them into [`Decimal`] without going through
//! floating point.
//!
//! A `delta` message carries only the fields that changed; use
//! [`TickerData::apply_delta`] to fold it into a held snapshot.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::topic::{StreamFamily, TopicKey, split_topic};

/// Family tag for ticker topics.
pub const TICKER_TAG: &str = "ticker";

/// Number of dot-delimited segments in a ticker topic.
const TICKER_SEGMENTS: usize = 2;

// =============================================================================
// Symbol
// =============================================================================

/// Exchange instrument symbol (e.g. `BTCUSDT`).
///
/// Symbols never contain `.`, the topic segment delimiter. A dotted symbol
/// produces a topic that no key parses back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol.
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    /// Get the symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Ticker Key
// =============================================================================

/// Key identifying one ticker stream.
///
/// The symbol must be free of `.` for [`TopicKey::from_topic`] to
/// recover the key from its topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TickerKey {
    /// Instrument symbol.
    pub symbol: Symbol,
}

impl TickerKey {
    /// Create a ticker key for a symbol.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
        }
    }
}

impl TopicKey for TickerKey {
    fn topic(&self) -> String {
        format!("{TICKER_TAG}.{}", self.symbol)
    }

    fn from_topic(topic: &str) -> Option<Self> {
        let parts = split_topic(topic, TICKER_TAG, TICKER_SEGMENTS)?;
        let [_, symbol] = parts.as_slice() else {
            return None;
        };

        Some(Self::new(*symbol))
    }
}

impl fmt::Display for TickerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic())
    }
}

// =============================================================================
// Ticker Family
// =============================================================================

/// Marker type for the ticker stream family.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ticker;

impl StreamFamily for Ticker {
    const TAG: &'static str = TICKER_TAG;
    type Key = TickerKey;
    type Payload = TickerResponse;
}

// =============================================================================
// Inbound Message
// =============================================================================

/// Kind of inbound stream message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Full state of the stream.
    #[default]
    Snapshot,
    /// Only the fields that changed since the previous message.
    Delta,
}

/// Inbound ticker message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerResponse {
    /// Topic string (e.g. `ticker.BTCUSDT`).
    pub topic: String,

    /// Snapshot or delta.
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Exchange timestamp in milliseconds since the Unix epoch.
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,

    /// Cross sequence, present on derivatives tickers.
    #[serde(rename = "cs", default, skip_serializing_if = "Option::is_none")]
    pub cross_sequence: Option<i64>,

    /// Ticker body.
    pub data: TickerData,
}

impl TickerResponse {
    /// Derive the ticker key from the message topic.
    #[must_use]
    pub fn key(&self) -> Option<TickerKey> {
        TickerKey::from_topic(&self.topic)
    }

    /// Exchange timestamp as a UTC datetime.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }

    /// Check if this message is a full snapshot.
    #[must_use]
    pub const fn is_snapshot(&self) -> bool {
        matches!(self.kind, MessageKind::Snapshot)
    }
}

/// Ticker body. Numeric fields are kept as the exchange's decimal text.
///
/// Fields absent from a message (as in deltas) deserialize to empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TickerData {
    /// Instrument symbol.
    pub symbol: String,
    /// Direction of the last price change (`PlusTick`, `ZeroMinusTick`, ...).
    pub tick_direction: String,
    /// 24h price change as a fraction.
    pub price_24h_pcnt: String,
    /// Last traded price.
    pub last_price: String,
    /// Price 24h ago.
    pub prev_price_24h: String,
    /// Highest price in the last 24h.
    pub high_price_24h: String,
    /// Lowest price in the last 24h.
    pub low_price_24h: String,
    /// Price 1h ago.
    pub prev_price_1h: String,
    /// Mark price.
    pub mark_price: String,
    /// Index price.
    pub index_price: String,
    /// Open interest (base units).
    pub open_interest: String,
    /// Open interest value (quote units).
    pub open_interest_value: String,
    /// 24h turnover (quote units).
    pub turnover_24h: String,
    /// 24h volume (base units).
    pub volume_24h: String,
    /// Next funding time in milliseconds since the Unix epoch.
    pub next_funding_time: String,
    /// Current funding rate.
    pub funding_rate: String,
    /// Best bid price.
    pub bid1_price: String,
    /// Best bid size.
    pub bid1_size: String,
    /// Best ask price.
    pub ask1_price: String,
    /// Best ask size.
    pub ask1_size: String,
}

impl TickerData {
    /// Fold a delta into this snapshot. Empty fields in `delta` are left as is.
    pub fn apply_delta(&mut self, delta: &Self) {
        merge_field(&mut self.symbol, &delta.symbol);
        merge_field(&mut self.tick_direction, &delta.tick_direction);
        merge_field(&mut self.price_24h_pcnt, &delta.price_24h_pcnt);
        merge_field(&mut self.last_price, &delta.last_price);
        merge_field(&mut self.prev_price_24h, &delta.prev_price_24h);
        merge_field(&mut self.high_price_24h, &delta.high_price_24h);
        merge_field(&mut self.low_price_24h, &delta.low_price_24h);
        merge_field(&mut self.prev_price_1h, &delta.prev_price_1h);
        merge_field(&mut self.mark_price, &delta.mark_price);
        merge_field(&mut self.index_price, &delta.index_price);
        merge_field(&mut self.open_interest, &delta.open_interest);
        merge_field(&mut self.open_interest_value, &delta.open_interest_value);
        merge_field(&mut self.turnover_24h, &delta.turnover_24h);
        merge_field(&mut self.volume_24h, &delta.volume_24h);
        merge_field(&mut self.next_funding_time, &delta.next_funding_time);
        merge_field(&mut self.funding_rate, &delta.funding_rate);
        merge_field(&mut self.bid1_price, &delta.bid1_price);
        merge_field(&mut self.bid1_size, &delta.bid1_size);
        merge_field(&mut self.ask1_price, &delta.ask1_price);
        merge_field(&mut self.ask1_size, &delta.ask1_size);
    }

    /// Last traded price.
    #[must_use]
    pub fn last_price_decimal(&self) -> Option<Decimal> {
        parse_decimal(&self.last_price)
    }

    /// Mark price.
    #[must_use]
    pub fn mark_price_decimal(&self) -> Option<Decimal> {
        parse_decimal(&self.mark_price)
    }

    /// Index price.
    #[must_use]
    pub fn index_price_decimal(&self) -> Option<Decimal> {
        parse_decimal(&self.index_price)
    }

    /// Best bid price.
    #[must_use]
    pub fn bid1_price_decimal(&self) -> Option<Decimal> {
        parse_decimal(&self.bid1_price)
    }

    /// Best bid size.
    #[must_use]
    pub fn bid1_size_decimal(&self) -> Option<Decimal> {
        parse_decimal(&self.bid1_size)
    }

    /// Best ask price.
    #[must_use]
    pub fn ask1_price_decimal(&self) -> Option<Decimal> {
        parse_decimal(&self.ask1_price)
    }

    /// Best ask size.
    #[must_use]
    pub fn ask1_size_decimal(&self) -> Option<Decimal> {
        parse_decimal(&self.ask1_size)
    }

    /// Funding rate.
    #[must_use]
    pub fn funding_rate_decimal(&self) -> Option<Decimal> {
        parse_decimal(&self.funding_rate)
    }

    /// Open interest.
    #[must_use]
    pub fn open_interest_decimal(&self) -> Option<Decimal> {
        parse_decimal(&self.open_interest)
    }

    /// 24h volume.
    #[must_use]
    pub fn volume_24h_decimal(&self) -> Option<Decimal> {
        parse_decimal(&self.volume_24h)
    }

    /// Best ask minus best bid, if both sides are present and the
    /// difference fits in a [`Decimal`].
    #[must_use]
    pub fn spread(&self) -> Option<Decimal> {
        self.ask1_price_decimal()?
            .checked_sub(self.bid1_price_decimal()?)
    }

    /// Next funding time as a UTC datetime.
    #[must_use]
    pub fn next_funding_time(&self) -> Option<DateTime<Utc>> {
        self.next_funding_time
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
    }
}

fn merge_field(target: &mut String, update: &str) {
    if !update.is_empty() {
        update.clone_into(target);
    }
}

fn parse_decimal(value: &str) -> Option<Decimal> {
    if value.is_empty() {
        return None;
    }
    Decimal::from_str(value).ok()
}

// =============================================================================
// Tests
// =============================================================================
