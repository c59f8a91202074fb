//! Message payloads exchanged with a front-end terminal.
//!
//! Framing belongs to whatever transport carries these records; this module
//! only fixes their JSON shape.

use crate::error::{EngineError, SerializableError};
use serde::{Deserialize, Deserializer, Serialize};

/// Raw terminal bytes.
///
/// Serialized as an array of byte values. Deserializes from such an array or
/// from a plain string, which is taken as UTF-8.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TerminalBytes(pub Vec<u8>);

impl<'de> Deserialize<'de> for TerminalBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Text(String),
            Bytes(Vec<u8>),
        }

        Ok(match Wire::deserialize(deserializer)? {
            Wire::Text(text) => TerminalBytes(text.into_bytes()),
            Wire::Bytes(bytes) => TerminalBytes(bytes),
        })
    }
}

impl From<Vec<u8>> for TerminalBytes {
    fn from(bytes: Vec<u8>) -> Self {
        TerminalBytes(bytes)
    }
}

impl From<&str> for TerminalBytes {
    fn from(text: &str) -> Self {
        TerminalBytes(text.as_bytes().to_vec())
    }
}

/// Client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Input { data: TerminalBytes },
    Resize { rows: u32, cols: u32 },
    Ping,
}

/// Server to client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected { session_id: String },
    Output { data: TerminalBytes },
    Error { message: String, error: SerializableError },
    Pong,
}

impl ServerMessage {
    pub fn output(data: Vec<u8>) -> Self {
        ServerMessage::Output {
            data: TerminalBytes(data),
        }
    }

    /// Error record for `err`; the message is sanitized before it leaves the engine.
    pub fn error(err: &EngineError) -> Self {
        let error = SerializableError::from(err);
        ServerMessage::Error {
            message: error.message.clone(),
            error,
        }
    }
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::Protocol(format!("Malformed message: {}", e)))
    }
}
