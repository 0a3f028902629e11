//! Relay wire messages.
//!
//! Control messages are UTF-8 JSON objects framed as individual WebSocket
//! text frames. The vocabulary is a closed set — unknown types are dropped
//! by the room — so the tag is a real enum rather than string dispatch.
//! Payloads stay as raw JSON: the room only inserts or strips routing keys
//! and forwards everything else (the `encrypted` flag included) verbatim.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The closed message vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    Registered,
    Ping,
    Pong,
    WorkspaceList,
    WorkspaceData,
    SessionCreate,
    SessionCreated,
    SessionClose,
    TerminalInput,
    TerminalOutput,
    TerminalResize,
    MobileConnected,
    MobileDisconnect,
    Error,
}

/// One wire frame: a type tag, an optional payload object, and the
/// server-assigned timestamp (ms since epoch). Clients may send their own
/// timestamp; the room overrides it on forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Why an inbound text frame could not become an [`Envelope`].
#[derive(Debug)]
pub enum ParseError {
    /// Not JSON, or JSON without a string `type` field.
    Malformed(String),
    /// Valid JSON with a `type` outside the vocabulary.
    UnknownType(String),
}

impl Envelope {
    /// Build a server-originated message, stamped now.
    pub fn new(msg_type: MessageType, payload: Value) -> Self {
        Self {
            msg_type,
            payload: Some(payload),
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }

    /// Parse an inbound text frame, distinguishing malformed JSON from a
    /// well-formed frame with an out-of-vocabulary type.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ParseError::Malformed(e.to_string()))?;
        let type_str = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::Malformed("missing `type` field".to_string()))?;
        let msg_type: MessageType =
            serde_json::from_value(Value::String(type_str.to_string()))
                .map_err(|_| ParseError::UnknownType(type_str.to_string()))?;
        Ok(Self {
            msg_type,
            payload: value.get("payload").cloned(),
            timestamp: value.get("timestamp").and_then(Value::as_i64),
        })
    }

    /// Re-stamp with the server clock before forwarding.
    pub fn stamp(mut self) -> Self {
        self.timestamp = Some(Utc::now().timestamp_millis());
        self
    }

    /// The payload as a mutable object map, inserting an empty one if the
    /// sender omitted it. Used by the room to add/strip routing keys.
    pub fn payload_object(&mut self) -> &mut Map<String, Value> {
        if !matches!(self.payload, Some(Value::Object(_))) {
            self.payload = Some(Value::Object(Map::new()));
        }
        match self.payload {
            Some(Value::Object(ref mut map)) => map,
            _ => unreachable!("payload normalised to an object above"),
        }
    }

    /// Serialise for the wire.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
