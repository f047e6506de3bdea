//! Stream Codec Module
//!
//! JSON encoding of operation requests and envelope-level decoding of
//! inbound text frames for Bybit's V5 public streams.
//!
//! Inbound frames are classified by shape before any family-specific decode:
//!
//! - objects with a string `topic` field are topic data;
//! - objects with an `op` field are operation acknowledgements;
//! - anything else is passed through as an unclassified value.
//!
//! Payload decoding into a family's message type is deferred until a handler
//! has been resolved for the topic.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::infrastructure::bybit::messages::{Operation, OperationRequest, OperationResponse};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding failed.
    #[error("JSON encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding failed.
    #[error("JSON decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// Subscribe or unsubscribe request without topics.
    #[error("{0} request requires at least one topic")]
    EmptyTopics(Operation),

    /// Frame is valid JSON but not an object.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// Inbound frame classified by envelope shape.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Topic data message.
    Topic {
        /// Wire topic of the message.
        topic: String,
        /// Full undecoded message.
        value: Value,
    },

    /// Operation acknowledgement.
    Operation(OperationResponse),

    /// Object with neither a topic nor a recognizable operation.
    Unclassified(Value),
}

/// JSON codec for Bybit public streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Build and encode an operation request for `topics`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::EmptyTopics`] for a subscribe or unsubscribe
    /// without topics, or [`CodecError::Encode`] if serialization fails.
    pub fn build_request(&self, op: Operation, topics: Vec<String>) -> Result<String, CodecError> {
        self.encode_request(&OperationRequest::new(op, topics))
    }

    /// Encode an operation request.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::EmptyTopics`] for a subscribe or unsubscribe
    /// without topics, or [`CodecError::Encode`] if serialization fails.
    pub fn encode_request(&self, request: &OperationRequest) -> Result<String, CodecError> {
        if request.op.requires_topics() && request.args.is_empty() {
            return Err(CodecError::EmptyTopics(request.op));
        }

        serde_json::to_string(request).map_err(CodecError::Encode)
    }

    /// Decode and classify an inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the frame is not valid JSON, or
    /// [`CodecError::InvalidFormat`] if it is not a JSON object.
    pub fn decode(&self, text: &str) -> Result<InboundFrame, CodecError> {
        let value: Value = serde_json::from_str(text).map_err(CodecError::Decode)?;

        if !value.is_object() {
            let trimmed = text.trim();
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON object, got: {}...",
                trimmed.chars().take(50).collect::<String>()
            )));
        }

        if let Some(topic) = Self::topic_of(&value) {
            let topic = topic.to_string();
            return Ok(InboundFrame::Topic { topic, value });
        }

        if value.get("op").is_some() {
            return Ok(match serde_json::from_value::<OperationResponse>(value.clone()) {
                Ok(ack) => InboundFrame::Operation(ack),
                Err(_) => InboundFrame::Unclassified(value),
            });
        }

        Ok(InboundFrame::Unclassified(value))
    }

    /// Read the `topic` field of a decoded frame, if it is a string.
    #[must_use]
    pub fn topic_of(value: &Value) -> Option<&str> {
        value.get("topic").and_then(Value::as_str)
    }

    /// Decode a topic message into its family payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the value does not match `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self, value: &Value) -> Result<T, CodecError> {
        T::deserialize(value).map_err(CodecError::Decode)
    }
}
