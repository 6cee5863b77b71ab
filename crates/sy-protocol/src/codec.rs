//! Text-frame codec helpers
//!
//! All Shipyard messages travel as single WebSocket text frames containing
//! one JSON object. These helpers keep the serde plumbing in one place so
//! connection handlers stay readable.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;

/// Encode a message into a text frame payload.
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a text frame payload into a message.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}
