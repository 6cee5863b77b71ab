//! Protocol error types

use thiserror::Error;

/// Errors produced while encoding or decoding wire messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Malformed JSON or a message that doesn't match the schema
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    /// A binary frame arrived where only text frames are defined
    #[error("Unexpected binary frame ({0} bytes)")]
    UnexpectedBinary(usize),
}
