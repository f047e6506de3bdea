//! Stream Client Configuration Settings
//!
//! Configuration types for the Bybit public stream client, loaded from
//! environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `BYBIT_NETWORK` | `mainnet` |
//! | `BYBIT_CATEGORY` | `linear` |
//! | `BYBIT_SYMBOLS` | `BTCUSDT` |
//! | `BYBIT_STREAM_HEARTBEAT_INTERVAL_SECS` | `20` |
//! | `BYBIT_STREAM_HEARTBEAT_TIMEOUT_SECS` | `20` |
//! | `BYBIT_STREAM_RECONNECT_DELAY_INITIAL_MS` | `500` |
//! | `BYBIT_STREAM_RECONNECT_DELAY_MAX_SECS` | `30` |
//! | `BYBIT_STREAM_RECONNECT_DELAY_MULTIPLIER` | `2.0` |
//! | `BYBIT_STREAM_MAX_RECONNECT_ATTEMPTS` | `0` (unlimited) |
//! | `BYBIT_STREAM_METRICS_PORT` | `9090` (0 disables) |
//!
//! Unparseable numeric values fall back to their defaults.

use std::str::FromStr;
use std::time::Duration;

use crate::domain::ticker::Symbol;

/// Bybit network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// Production network.
    #[default]
    Mainnet,
    /// Test network.
    Testnet,
}

impl Network {
    /// Parse network from string; anything but `testnet` is mainnet.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "testnet" => Self::Testnet,
            _ => Self::Mainnet,
        }
    }

    /// WebSocket host for this network.
    #[must_use]
    pub const fn stream_host(&self) -> &'static str {
        match self {
            Self::Mainnet => "stream.bybit.com",
            Self::Testnet => "stream-testnet.bybit.com",
        }
    }

    /// Get the network name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }
}

/// Product category, selecting the public stream path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Category {
    /// Spot trading pairs.
    Spot,
    /// USDT and USDC perpetuals and futures.
    #[default]
    Linear,
    /// Inverse contracts.
    Inverse,
    /// Options.
    Option,
}

impl Category {
    /// Get the category path segment.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Linear => "linear",
            Self::Inverse => "inverse",
            Self::Option => "option",
        }
    }
}

impl FromStr for Category {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "spot" => Ok(Self::Spot),
            "linear" => Ok(Self::Linear),
            "inverse" => Ok(Self::Inverse),
            "option" => Ok(Self::Option),
            other => Err(ConfigError::InvalidValue {
                key: "BYBIT_CATEGORY".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// How long a ping may stay unanswered.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(20),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

/// Complete stream client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Bybit network.
    pub network: Network,
    /// Product category.
    pub category: Category,
    /// Symbols the binary subscribes to.
    pub symbols: Vec<Symbol>,
    /// WebSocket connection settings.
    pub websocket: WebSocketSettings,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            category: Category::default(),
            symbols: vec![Symbol::new("BTCUSDT")],
            websocket: WebSocketSettings::default(),
            metrics_port: 9090,
        }
    }
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `BYBIT_CATEGORY` is not a known category or
    /// `BYBIT_SYMBOLS` lists no symbols.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`StreamConfig::from_env`].
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let network = lookup("BYBIT_NETWORK")
            .map(|s| Network::from_str_case_insensitive(&s))
            .unwrap_or_default();

        let category = lookup("BYBIT_CATEGORY")
            .map(|s| s.parse::<Category>())
            .transpose()?
            .unwrap_or_default();

        let symbols = match lookup("BYBIT_SYMBOLS") {
            Some(raw) => parse_symbols(&raw)?,
            None => defaults.symbols,
        };

        let ws = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            heartbeat_interval: lookup("BYBIT_STREAM_HEARTBEAT_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .map_or(ws.heartbeat_interval, Duration::from_secs),
            heartbeat_timeout: lookup("BYBIT_STREAM_HEARTBEAT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map_or(ws.heartbeat_timeout, Duration::from_secs),
            reconnect_delay_initial: lookup("BYBIT_STREAM_RECONNECT_DELAY_INITIAL_MS")
                .and_then(|v| v.parse().ok())
                .map_or(ws.reconnect_delay_initial, Duration::from_millis),
            reconnect_delay_max: lookup("BYBIT_STREAM_RECONNECT_DELAY_MAX_SECS")
                .and_then(|v| v.parse().ok())
                .map_or(ws.reconnect_delay_max, Duration::from_secs),
            reconnect_delay_multiplier: parse_or(
                lookup("BYBIT_STREAM_RECONNECT_DELAY_MULTIPLIER"),
                ws.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_or(
                lookup("BYBIT_STREAM_MAX_RECONNECT_ATTEMPTS"),
                ws.max_reconnect_attempts,
            ),
        };

        let metrics_port = parse_or(lookup("BYBIT_STREAM_METRICS_PORT"), defaults.metrics_port);

        Ok(Self {
            network,
            category,
            symbols,
            websocket,
            metrics_port,
        })
    }

    /// Get the public stream WebSocket URL.
    #[must_use]
    pub fn stream_url(&self) -> String {
        format!(
            "wss://{}/v5/public/{}",
            self.network.stream_host(),
            self.category.as_str()
        )
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has an unrecognized value.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
    },
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

/// Split a comma-separated symbol list. Symbols containing `.` are rejected
/// since they cannot round-trip through a dotted topic.
fn parse_symbols(raw: &str) -> Result<Vec<Symbol>, ConfigError> {
    let symbols = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.contains('.') {
                return Err(ConfigError::InvalidValue {
                    key: "BYBIT_SYMBOLS".to_string(),
                    value: s.to_string(),
                });
            }
            Ok(Symbol::new(s.to_uppercase()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if symbols.is_empty() {
        return Err(ConfigError::EmptyValue("BYBIT_SYMBOLS".to_string()));
    }

    Ok(symbols)
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
