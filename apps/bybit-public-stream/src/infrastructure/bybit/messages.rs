//! Bybit WebSocket Message Types
//!
//! Wire format types for the operation envelopes exchanged with Bybit's V5
//! public streams. Topic data messages are family-specific and live with
//! their family in the domain layer.
//!
//! # Outbound
//!
//! ```json
//! {"op": "subscribe", "args": ["ticker.BTCUSDT"]}
//! {"op": "unsubscribe", "args": ["ticker.BTCUSDT"]}
//! {"op": "ping"}
//! ```
//!
//! # Inbound Acknowledgements
//!
//! ```json
//! {"success": true, "ret_msg": "", "conn_id": "2324d924", "op": "subscribe"}
//! {"success": true, "ret_msg": "pong", "conn_id": "0970e817", "op": "ping"}
//! {"req_id": "", "op": "pong", "args": ["1675418560633"], "conn_id": "cfcb4ocsvfriu23r3er0"}
//! ```
//!
//! # References
//!
//! - [WebSocket Connect](https://bybit-exchange.github.io/docs/v5/ws/connect)

use serde::{Deserialize, Serialize};

// =============================================================================
// Operation
// =============================================================================

/// Operation tag carried in the `op` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Subscribe to topics.
    Subscribe,
    /// Unsubscribe from topics.
    Unsubscribe,
    /// Application-level ping.
    Ping,
    /// Application-level pong.
    Pong,
    /// Authenticate the connection (private streams only).
    Auth,
}

impl Operation {
    /// Get the wire name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Auth => "auth",
        }
    }

    /// Check if the operation carries a topic list.
    #[must_use]
    pub const fn requires_topics(self) -> bool {
        matches!(self, Self::Subscribe | Self::Unsubscribe)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Outbound Request
// =============================================================================

/// Operation request sent to the server.
///
/// Field order is `op`, `args`, `req_id`; `req_id` and an empty `args` list
/// are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Operation tag.
    pub op: Operation,

    /// Ordered topic list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Optional request identifier echoed back in the acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
}

impl OperationRequest {
    /// Create a request for any operation.
    #[must_use]
    pub const fn new(op: Operation, args: Vec<String>) -> Self {
        Self {
            op,
            args,
            req_id: None,
        }
    }

    /// Create a subscribe request.
    #[must_use]
    pub const fn subscribe(topics: Vec<String>) -> Self {
        Self::new(Operation::Subscribe, topics)
    }

    /// Create an unsubscribe request.
    #[must_use]
    pub const fn unsubscribe(topics: Vec<String>) -> Self {
        Self::new(Operation::Unsubscribe, topics)
    }

    /// Create a heartbeat ping.
    #[must_use]
    pub const fn ping() -> Self {
        Self::new(Operation::Ping, Vec::new())
    }

    /// Attach a request identifier.
    #[must_use]
    pub fn with_req_id(mut self, req_id: impl Into<String>) -> Self {
        self.req_id = Some(req_id.into());
        self
    }
}

// =============================================================================
// Inbound Acknowledgement
// =============================================================================

/// Server acknowledgement of an operation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResponse {
    /// Whether the operation succeeded. Absent on linear/inverse pongs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    /// Server message (`"pong"`, or an error description on failure).
    #[serde(default)]
    pub ret_msg: String,

    /// Server-side connection identifier.
    #[serde(default)]
    pub conn_id: String,

    /// Echoed request identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,

    /// Acknowledged operation.
    pub op: Option<Operation>,

    /// Operation arguments (pong timestamps on derivatives streams).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl OperationResponse {
    /// Check if the server accepted the operation.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(true)
    }

    /// Check if this is a heartbeat reply.
    #[must_use]
    pub fn is_pong(&self) -> bool {
        matches!(self.op, Some(Operation::Pong))
            || (matches!(self.op, Some(Operation::Ping)) && self.ret_msg == "pong")
    }
}

// =============================================================================
// Tests
// =============================================================================
