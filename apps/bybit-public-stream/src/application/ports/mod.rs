//! Port Interfaces
//!
//! Contracts between the subscription core and the connection that carries
//! it.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FrameSink`: sends encoded request frames over the live connection
//!
//! ## Driver Ports (Inbound)
//!
//! - `TopicDispatcher`: receives inbound text frames from the read loop

use async_trait::async_trait;

use crate::error::StreamError;

/// Frame send error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// No connection is currently established.
    #[error("not connected")]
    NotConnected,

    /// The transport rejected the frame.
    #[error("transport error: {message}")]
    Transport {
        /// Transport error description.
        message: String,
    },
}

/// Port for sending text frames over the stream connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] if there is no live connection,
    /// or [`SendError::Transport`] if the write fails.
    async fn send_frame(&self, frame: String) -> Result<(), SendError>;
}

/// Port through which the read loop hands inbound frames to a stream family.
pub trait TopicDispatcher: Send + Sync {
    /// Family tag this dispatcher serves.
    fn family(&self) -> &'static str;

    /// Route one raw inbound frame to its handler.
    ///
    /// Frames for other families, frames without a topic and topics without
    /// a handler are dropped with `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns a decode error for unparseable frames, or the handler's error.
    fn dispatch(&self, raw: &str) -> Result<(), StreamError>;

    /// Route an already-parsed topic message.
    ///
    /// # Errors
    ///
    /// Same as [`TopicDispatcher::dispatch`].
    fn dispatch_value(&self, topic: &str, value: &serde_json::Value) -> Result<(), StreamError>;

    /// Topics currently subscribed, used to restore them after a reconnect.
    fn active_topics(&self) -> Vec<String>;
}
