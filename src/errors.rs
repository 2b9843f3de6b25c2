//! Connection-level error types.
//!
//! Wire-level failures live in [`crate::codec::CodecError`]; everything the
//! connection surfaces to callers is a [`TChannelError`].

use crate::codec::CodecError;
use crate::messages::{ErrorCode, ErrorMessage, Tracing};
use std::io;
use thiserror::Error;

/// Error type for all connection operations.
#[derive(Debug, Error)]
pub enum TChannelError {
    /// The underlying stream failed or was closed. Propagated to every
    /// outstanding slot and to any blocked receive when the connection goes
    /// down.
    #[error("network error: {0}")]
    Network(String),

    /// I/O error on the underlying stream.
    #[error("connection i/o error: {0}")]
    Io(#[from] io::Error),

    /// A message violated the protocol: handshake missing required headers,
    /// wrong handshake type, or a continuation frame with no call in
    /// progress.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A per-call ttl elapsed before the response arrived.
    #[error("request timed out")]
    Timeout,

    /// A typed ERROR frame received from the peer.
    #[error("remote error {code:?} for message {id}: {description}")]
    Protocol {
        code: ErrorCode,
        description: String,
        id: u32,
        tracing: Tracing,
    },

    /// A frame or message failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A specialized `Result` type for connection operations.
pub type Result<T> = std::result::Result<T, TChannelError>;

impl TChannelError {
    /// Builds the typed error corresponding to an ERROR frame from the peer.
    pub fn from_error_message(message: &ErrorMessage) -> TChannelError {
        TChannelError::Protocol {
            code: message.code,
            description: message.description.clone(),
            id: message.id,
            tracing: message.tracing,
        }
    }

    pub(crate) fn closed() -> TChannelError {
        TChannelError::Network("connection closed".to_string())
    }
}
