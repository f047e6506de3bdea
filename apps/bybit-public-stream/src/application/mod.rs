//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the per-family stream services and the port
//! interfaces that connect them to a live connection.

/// Port interfaces for the connection (frame sink, topic dispatch).
pub mod ports;

/// Stream services for subscribing and dispatching.
pub mod services;
