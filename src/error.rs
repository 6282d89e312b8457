//! Custom error types for the capability runtime.
//!
//! `VcapError` consolidates every failure the runtime can produce. The
//! variants mirror the containment policy of the protocol: per-command
//! failures (`CapabilityNotFound`, `HandlerFailure`, `MalformedCommand`) are
//! caught at the handler boundary and converted into `error` responses, so
//! they never tear down the dispatch loop. Only transport-level failures
//! (`ConnectionLost`, `Io`) end a connection.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type VcapResult<T> = std::result::Result<T, VcapError>;

#[derive(Error, Debug)]
pub enum VcapError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection to peer lost")]
    ConnectionLost,

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Capability '{capability}' failed: {message}")]
    HandlerFailure { capability: String, message: String },

    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error("No pending invocation for correlation id {0}")]
    CorrelationMiss(String),
}
