//! Domain Layer - Topic keys, stream families and subscription tracking.
//!
//! This layer holds the types that identify subscribable streams and the
//! registry that maps them to handlers. Nothing here performs I/O.

/// Topic key and stream family abstractions.
pub mod topic;

/// Ticker stream family (`ticker.<SYMBOL>`).
pub mod ticker;

/// Topic-keyed handler registry.
pub mod subscription;
