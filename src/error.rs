//! Error types for the driver.
//!
//! `AriesError` is the single error enum for the crate. Every fallible public
//! API returns `Result<T, AriesError>`, and pending requests resolve with one
//! of these variants on the failure path, so callers can match on the kind
//! without string inspection.
//!
//! Rough taxonomy:
//!
//! - **`Transport`**: resolve/connect failures, socket read/write failures,
//!   and disconnection.
//! - **`Protocol`**: an inbound line that does not match the ARIES response
//!   grammar, or a reply missing an expected field.
//! - **`QueueOverflow` / `WriterStopped`**: outbound enqueue failures. These
//!   fail only the originating request, never the connection.
//! - **`Timeout`**: a bounded wait on a pending reply expired. The connection
//!   stays up; a late reply is routed as a spontaneous message.
//! - **`NotConnected`**: an operation was attempted with no live connection.
//! - **`Cancelled`**: the owning connection generation is being torn down and
//!   the request can no longer complete.
//! - **`Config`**: a configuration value parsed but failed semantic
//!   validation.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type AriesResult<T> = std::result::Result<T, AriesError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AriesError {
    /// Connect/resolve failure or a socket-level read/write error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Inbound line violated the response grammar.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The writer queue was at capacity; the command was not sent.
    #[error("writer queue overflow")]
    QueueOverflow,

    /// The writer is stopped or shutting down; the command was not sent.
    #[error("writer stopped")]
    WriterStopped,

    /// A bounded wait for a device reply expired.
    #[error("timeout waiting for response")]
    Timeout,

    /// Operation attempted while no connection is established.
    #[error("not connected")]
    NotConnected,

    /// The request was terminated because its connection generation is being
    /// torn down (disconnect or explicit stop).
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Configuration value failed semantic validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AriesError {
    /// Shorthand used by the transport when wrapping `std::io::Error`.
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        AriesError::Transport(err.to_string())
    }
}
