//! Bybit WebSocket Adapters
//!
//! Implements the connection side of Bybit's V5 public streams:
//!
//! - **Messages**: operation request and acknowledgement envelopes
//! - **Codec**: JSON encoding and inbound frame classification
//! - **Client**: connection lifecycle, heartbeat and reconnect

pub mod client;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;

pub use client::{
    ClientError, MAX_ARGS_PER_REQUEST, PublicStreamClient, PublicStreamClientConfig, StreamEvent,
};
pub use codec::{CodecError, InboundFrame, JsonCodec};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use messages::{Operation, OperationRequest, OperationResponse};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
