//! Subscription Registry
//!
//! Maps each topic key of a stream family to the single handler registered
//! for it.
//!
//! # Design
//!
//! The registry is shared between callers subscribing and unsubscribing and
//! the connection read loop resolving handlers for inbound messages. Every
//! operation takes the same mutex, so registration, removal and lookup are
//! mutually exclusive. Handlers are handed out as `Arc` clones and invoked
//! after the lock is released; a handler may subscribe or unsubscribe from
//! inside its own callback.
//!
//! Each successful registration gets a fresh [`SubscriptionId`]. Removing by
//! id only succeeds while that exact registration is still in place, so an
//! old holder cannot remove a later registration for the same key.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::domain::topic::{StreamFamily, TopicKey};

// =============================================================================
// Handler
// =============================================================================

/// Callback invoked with each decoded message for a subscribed topic.
///
/// Implemented for any `Fn(P) -> anyhow::Result<()>` closure.
pub trait MessageHandler<P>: Send + Sync {
    /// Handle one decoded message.
    ///
    /// # Errors
    ///
    /// Any error is returned to the dispatcher as the dispatch result.
    fn handle(&self, payload: P) -> anyhow::Result<()>;
}

impl<P, F> MessageHandler<P> for F
where
    F: Fn(P) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, payload: P) -> anyhow::Result<()> {
        self(payload)
    }
}

/// Shared handle to a registered handler.
pub type SharedHandler<P> = Arc<dyn MessageHandler<P>>;

/// Identity of one registration, unique within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration<P> {
    id: SubscriptionId,
    handler: SharedHandler<P>,
}

// =============================================================================
// Errors
// =============================================================================

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A handler is already registered for this topic.
    #[error("already subscribed to {topic}")]
    DuplicateSubscription {
        /// Topic of the rejected key.
        topic: String,
    },

    /// No handler is registered for this topic.
    #[error("no handler registered for {topic}")]
    HandlerNotFound {
        /// Topic of the unresolved key.
        topic: String,
    },
}

// =============================================================================
// Registry
// =============================================================================

/// Topic-keyed handler registry for one stream family.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use bybit_public_stream::domain::subscription::{RegistryError, SubscriptionRegistry};
/// use bybit_public_stream::domain::ticker::{Ticker, TickerKey, TickerResponse};
///
/// let registry = SubscriptionRegistry::<Ticker>::new();
/// let key = TickerKey::new("BTCUSDT");
///
/// let noop = |_msg: TickerResponse| -> anyhow::Result<()> { Ok(()) };
///
/// let id = registry.register(key.clone(), Arc::new(noop)).unwrap();
///
/// // Second registration for the same key is rejected
/// let err = registry.register(key.clone(), Arc::new(noop)).unwrap_err();
/// assert!(matches!(err, RegistryError::DuplicateSubscription { .. }));
///
/// assert!(registry.resolve(&key).is_ok());
/// assert!(registry.unregister_id(&key, id));
/// assert!(registry.resolve(&key).is_err());
/// ```
pub struct SubscriptionRegistry<F: StreamFamily> {
    handlers: Mutex<HashMap<F::Key, Registration<F::Payload>>>,
    next_id: AtomicU64,
}

impl<F: StreamFamily> Default for SubscriptionRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: StreamFamily> fmt::Debug for SubscriptionRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("family", &F::TAG)
            .field("subscriptions", &self.len())
            .finish()
    }
}

impl<F: StreamFamily> SubscriptionRegistry<F> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for `key`, returning the id of the new registration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateSubscription`] if `key` already has
    /// a handler. The existing handler is kept.
    pub fn register(
        &self,
        key: F::Key,
        handler: SharedHandler<F::Payload>,
    ) -> Result<SubscriptionId, RegistryError> {
        match self.handlers.lock().entry(key) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateSubscription {
                topic: entry.key().topic(),
            }),
            Entry::Vacant(entry) => {
                let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
                entry.insert(Registration { id, handler });
                Ok(id)
            }
        }
    }

    /// Remove the handler for `key`. Absence is not an error.
    ///
    /// Returns `true` if a handler was removed.
    pub fn unregister(&self, key: &F::Key) -> bool {
        self.handlers.lock().remove(key).is_some()
    }

    /// Remove the handler for `key` only if it is registration `id`.
    ///
    /// Returns `true` if a handler was removed.
    pub fn unregister_id(&self, key: &F::Key, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        if handlers.get(key).is_some_and(|r| r.id == id) {
            handlers.remove(key);
            return true;
        }
        false
    }

    /// Check if `key` is currently held by registration `id`.
    #[must_use]
    pub fn is_current(&self, key: &F::Key, id: SubscriptionId) -> bool {
        self.handlers.lock().get(key).is_some_and(|r| r.id == id)
    }

    /// Look up the handler for `key` without removing it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::HandlerNotFound`] if `key` has no handler.
    pub fn resolve(&self, key: &F::Key) -> Result<SharedHandler<F::Payload>, RegistryError> {
        let handler = self
            .handlers
            .lock()
            .get(key)
            .map(|r| Arc::clone(&r.handler));

        handler.ok_or_else(|| RegistryError::HandlerNotFound { topic: key.topic() })
    }

    /// Check if `key` has a handler.
    #[must_use]
    pub fn contains(&self, key: &F::Key) -> bool {
        self.handlers.lock().contains_key(key)
    }

    /// Number of registered keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Check if no keys are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Snapshot of the registered keys.
    #[must_use]
    pub fn keys(&self) -> Vec<F::Key> {
        self.handlers.lock().keys().cloned().collect()
    }

    /// Snapshot of the registered topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.lock().keys().map(TopicKey::topic).collect();
        topics.sort_unstable();
        topics
    }
}

// =============================================================================
// Tests
// =============================================================================
