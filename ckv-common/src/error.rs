//! # Protocol Errors
//!
//! Failures raised while framing or decoding RESP2 traffic.

use thiserror::Error;

/// Result alias for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors surfaced by the RESP2 encoder/decoder.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying reader failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Peer closed the stream before a full frame arrived.
    #[error("connection closed by peer")]
    Eof,
    /// Frame did not follow RESP2 layout.
    #[error("malformed frame: {0}")]
    Framing(&'static str),
    /// Length or integer field was not a decimal number.
    #[error("invalid integer in frame")]
    InvalidInteger,
}
