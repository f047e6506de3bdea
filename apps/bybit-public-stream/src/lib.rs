#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Bybit Public Stream - Topic-Keyed Market Data Client
//!
//! Maintains one WebSocket connection to Bybit's V5 public feed and routes
//! inbound topic messages to typed handlers registered per topic key.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: Topic identity and subscription tracking
//!   - `topic`: Topic key and stream family traits
//!   - `ticker`: The `ticker.<SYMBOL>` family and its message types
//!   - `subscription`: Topic-keyed handler registry
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Frame sink and topic dispatcher interfaces
//!   - `services`: Per-family subscribe/unsubscribe/dispatch facade
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `bybit`: WebSocket client, codec, heartbeat and reconnect policy
//!   - `config`: Environment configuration
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: Tracing subscriber and OTLP export
//!
//! # Data Flow
//!
//! ```text
//!                  subscribe(key, handler)
//!   caller ──────────────► TickerService ──► registry
//!                              │
//!                              ▼ {"op":"subscribe","args":["ticker.BTCUSDT"]}
//!   Bybit WS ◄──────── PublicStreamClient
//!      │                       ▲
//!      └── {"topic":"ticker.BTCUSDT",...} ──► dispatch ──► handler(TickerResponse)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Topic keys and subscription registry with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Facade error type.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::subscription::{
    MessageHandler, RegistryError, SharedHandler, SubscriptionId, SubscriptionRegistry,
};
pub use domain::ticker::{MessageKind, Symbol, Ticker, TickerData, TickerKey, TickerResponse};
pub use domain::topic::{StreamFamily, TopicKey};

// Application services
pub use application::ports::{FrameSink, SendError, TopicDispatcher};
pub use application::services::{StreamService, TickerService, Unsubscribe};
pub use error::StreamError;

// Infrastructure config
pub use infrastructure::config::{Category, ConfigError, Network, StreamConfig, WebSocketSettings};

// Bybit client
pub use infrastructure::bybit::{
    ClientError, JsonCodec, PublicStreamClient, PublicStreamClientConfig, StreamEvent,
};

// Metrics
pub use infrastructure::metrics::{MetricsError, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
