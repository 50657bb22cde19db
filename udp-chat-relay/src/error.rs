//! Failure taxonomy for the relay.
//!
//! Everything here is converted into a `{success: false, reason}` reply at the
//! router boundary; nothing propagates out of the receive loop.

use thiserror::Error;

/// A datagram that could not be turned into a [`crate::message::Request`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8")]
    Utf8,
    #[error("datagram is not valid JSON: {0}")]
    Json(String),
    #[error("datagram must be a JSON object")]
    NotAnObject,
    #[error("missing `request` field")]
    MissingRequest,
    #[error("unknown request kind '{0}'")]
    UnknownRequest(String),
    #[error("invalid fields for '{request}': {reason}")]
    InvalidFields { request: String, reason: String },
}

/// Errors produced while handling a decoded request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("room '{0}' not found")]
    RoomNotFound(String),

    #[error("user '{0}' not found")]
    UserNotFound(String),

    #[error("no pending transfer of '{filename}' from '{sender}' to '{recipient}'")]
    TransferNotFound {
        sender: String,
        recipient: String,
        filename: String,
    },

    #[error("transfer of '{filename}' is already pending")]
    TransferExists { filename: String },

    #[error("cannot {event} while transfer is {from}")]
    InvalidTransition { from: &'static str, event: &'static str },

    #[error("chunk {seq} is out of range for a {total}-chunk transfer")]
    ChunkOutOfRange { seq: u32, total: u32 },

    #[error("chunk declares {got} total chunks but transfer expects {expected}")]
    ChunkCountMismatch { expected: u32, got: u32 },

    #[error("chunk payload is not valid hex")]
    InvalidChunk,

    #[error("transfer would hold {len} bytes, limit is {limit}")]
    SizeExceeded { len: u64, limit: u64 },

    #[error("transfer declared {declared} bytes but delivered {received}")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("transfer of at most {limit} bytes cannot span {total} chunks")]
    TooManyChunks { total: u32, limit: u64 },

    /// `missing` lists at most the first few gaps; `count` is the full number.
    #[error("transfer incomplete, {count} chunk(s) missing")]
    Incomplete { missing: Vec<u32>, count: u64 },

    #[error("{resource} limit of {limit} reached")]
    ResourceExhausted {
        resource: &'static str,
        limit: usize,
    },

    #[error("encoded message is {len} bytes, datagram limit is {limit}")]
    Oversized { len: usize, limit: usize },

    #[error("failed to encode message: {0}")]
    Encode(String),
}
