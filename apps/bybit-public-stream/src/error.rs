//! Stream Errors
//!
//! Facade-level error composing the per-component error types.
//!
//! | Source | Variant | Handling |
//! |--------|---------|----------|
//! | Registry | [`StreamError::Registry`] | Duplicate returned to the subscriber; missing handler never escapes dispatch |
//! | Codec | [`StreamError::Codec`] | Returned to whichever call encoded or decoded |
//! | Sink | [`StreamError::Send`] | Returned to the subscribe/unsubscribe caller |
//! | Handler | [`StreamError::Handler`] | Returned as the dispatch result |

use crate::application::ports::SendError;
use crate::domain::subscription::RegistryError;
use crate::infrastructure::bybit::codec::CodecError;

/// Errors returned by stream facades and dispatchers.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Subscription registry rejected the operation.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Request encoding or message decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The connection could not send the request.
    #[error(transparent)]
    Send(#[from] SendError),

    /// A subscription handler returned an error.
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
}

impl StreamError {
    /// Check if this is a duplicate subscription rejection.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(
            self,
            Self::Registry(RegistryError::DuplicateSubscription { .. })
        )
    }

    /// Short label for metrics and events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Registry(_) => "registry",
            Self::Codec(_) => "codec",
            Self::Send(_) => "send",
            Self::Handler(_) => "handler",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_is_detected() {
        let err = StreamError::from(RegistryError::DuplicateSubscription {
            topic: "ticker.BTCUSDT".to_string(),
        });

        assert!(err.is_duplicate());
        assert_eq!(err.kind(), "registry");
        assert_eq!(err.to_string(), "already subscribed to ticker.BTCUSDT");
    }

    #[test]
    fn send_error_is_transparent() {
        let err = StreamError::from(SendError::NotConnected);

        assert!(!err.is_duplicate());
        assert_eq!(err.kind(), "send");
        assert_eq!(err.to_string(), "not connected");
    }

    #[test]
    fn handler_error_keeps_context() {
        let inner = anyhow::anyhow!("disk full").context("persisting ticker");
        let err = StreamError::Handler(inner);

        assert_eq!(err.kind(), "handler");
        assert_eq!(err.to_string(), "handler failed: persisting ticker: disk full");
    }
}
