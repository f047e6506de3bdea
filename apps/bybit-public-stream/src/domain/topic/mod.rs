//! Topic Keys and Stream Families
//!
//! A stream family is a class of topics sharing a wire prefix and a payload
//! shape. Each family owns a key type that renders to a dot-delimited topic
//! string and parses back from one.
//!
//! # Topic Format
//!
//! ```text
//! <family>.<field>[.<field>...]
//! ticker.BTCUSDT
//! ```
//!
//! Parsing is lossy on error: a topic from another family, or with the wrong
//! number of segments, yields no key rather than an error. Dispatch relies on
//! this to stay non-fatal when several families share one connection.

use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;

/// Separator between topic segments on the wire.
pub const TOPIC_SEPARATOR: char = '.';

/// Strongly-typed identifier for one subscribable stream.
///
/// Implementations must keep `topic` injective within the family and
/// satisfy `from_topic(&key.topic()) == Some(key)`.
pub trait TopicKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Render the wire-level topic string.
    fn topic(&self) -> String;

    /// Parse a wire topic back into a key.
    ///
    /// Returns `None` if the topic does not belong to this family or has the
    /// wrong segment count.
    fn from_topic(topic: &str) -> Option<Self>;
}

/// A family of streams sharing a topic prefix and payload shape.
pub trait StreamFamily: Send + Sync + 'static {
    /// Family tag, the first topic segment.
    const TAG: &'static str;

    /// Key identifying one stream in this family.
    type Key: TopicKey;

    /// Decoded inbound message delivered to handlers.
    type Payload: DeserializeOwned + Send + 'static;
}

/// Split `topic` into its segments if it starts with `tag` and has exactly
/// `segments` parts.
#[must_use]
pub fn split_topic<'a>(topic: &'a str, tag: &str, segments: usize) -> Option<Vec<&'a str>> {
    let parts: Vec<&str> = topic.split(TOPIC_SEPARATOR).collect();

    if parts.len() != segments || parts.first() != Some(&tag) {
        return None;
    }

    Some(parts)
}
