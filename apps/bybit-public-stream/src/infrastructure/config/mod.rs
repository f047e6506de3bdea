//! Configuration Module
//!
//! Configuration loading for the stream client.

mod settings;

pub use settings::{Category, ConfigError, Network, StreamConfig, WebSocketSettings};
