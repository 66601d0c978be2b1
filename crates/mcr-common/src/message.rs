//! JSON wire messages.
//!
//! Inbound text frames decode into an [`Envelope`], whose required fields are
//! all optional so that a structurally valid but incomplete message can be
//! reported as `MISSING_FIELDS` instead of a parse failure. Validation turns an
//! envelope into a [`Message`], in which every required field is present.

use crate::types::error_code;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Message type. Unknown wire names are preserved in [`MessageType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Relay → new peer: registry snapshot after admission.
    Welcome,
    /// Peer → relay liveness check.
    Heartbeat,
    /// Relay → peer reply to a heartbeat.
    HeartbeatAck,
    /// Peer → relay: merge payload fields into the peer's identity.
    ServerRegister,
    /// Relay → peers: another peer joined or left.
    ServerUpdate,
    /// Peer → peer: ask the target to accept a player transfer.
    TeleportRequest,
    /// Peer → peer(s): answer to a teleport request.
    TeleportResponse,
    /// Peer → peers: free-form status announcement.
    StatusUpdate,
    /// Relay → peer: the previous frame was rejected.
    Error,
    /// Any type name outside the enumeration.
    Other(String),
}

impl MessageType {
    /// Wire name of this type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Welcome => "welcome",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::ServerRegister => "server_register",
            Self::ServerUpdate => "server_update",
            Self::TeleportRequest => "teleport_request",
            Self::TeleportResponse => "teleport_response",
            Self::StatusUpdate => "status_update",
            Self::Error => "error",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "welcome" => Self::Welcome,
            "heartbeat" => Self::Heartbeat,
            "heartbeat_ack" => Self::HeartbeatAck,
            "server_register" => Self::ServerRegister,
            "server_update" => Self::ServerUpdate,
            "teleport_request" => Self::TeleportRequest,
            "teleport_response" => Self::TeleportResponse,
            "status_update" => Self::StatusUpdate,
            "error" => Self::Error,
            _ => Self::Other(name),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded but not yet validated message.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: Option<MessageType>,
    /// Unique message id.
    pub id: Option<String>,
    /// RFC 3339 timestamp, as sent.
    pub timestamp: Option<String>,
    /// Sender id.
    pub from: Option<String>,
    /// Recipient id or `"broadcast"`.
    pub to: Option<String>,
    /// Payload object; `null` and absent both mean empty.
    pub payload: Option<Map<String, Value>>,
    /// Optional base64 HMAC.
    pub signature: Option<String>,
}

/// A complete message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Unique message id.
    pub id: String,
    /// RFC 3339 timestamp. Kept as the wire string so signatures verify byte-for-byte.
    pub timestamp: String,
    /// Sender id, or `"relay"`.
    pub from: String,
    /// Recipient id, or `"broadcast"`.
    pub to: String,
    /// Payload object.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Base64 HMAC; always set on relay-originated messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Message {
    /// Reads a string field from the payload.
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// A frame that could not be decoded at all.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The bytes were not a JSON message object.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

impl CodecError {
    /// Wire error code reported back to the sender.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        error_code::INVALID_PAYLOAD
    }
}

/// A decoded message rejected by validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// One or more of `type`, `id`, `from`, `to`, `timestamp` was absent or empty.
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    /// The timestamp is outside the freshness window.
    #[error("message timestamp outside freshness window (skew {skew_ms} ms)")]
    StaleTimestamp {
        /// Absolute distance from the receiver's clock.
        skew_ms: i64,
    },
    /// The timestamp is not RFC 3339.
    #[error("invalid timestamp")]
    InvalidTimestamp,
    /// A signature was present and did not verify.
    #[error("invalid signature")]
    BadSignature,
}

impl ValidationError {
    /// Wire error code reported back to the sender.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingFields(_) => error_code::MISSING_FIELDS,
            Self::StaleTimestamp { .. } => error_code::STALE_TIMESTAMP,
            Self::InvalidTimestamp => error_code::INVALID_TIMESTAMP,
            Self::BadSignature => error_code::INVALID_SIGNATURE,
        }
    }
}

/// Decodes one frame.
///
/// # Errors
///
/// Returns [`CodecError::InvalidPayload`] if the bytes are not a JSON object
/// with correctly typed fields.
///
/// # Examples
///
/// ```
/// use mcr_common::message::{decode, MessageType};
///
/// let env = decode(br#"{"type":"heartbeat","id":"1"}"#).unwrap();
/// assert_eq!(env.kind, Some(MessageType::Heartbeat));
/// assert!(env.to.is_none());
/// ```
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn present(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

impl Envelope {
    /// Checks that all required fields are present and non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingFields`] naming every absent field.
    pub fn into_message(self) -> Result<Message, ValidationError> {
        let kind = self.kind.filter(|k| !k.as_str().is_empty());
        let id = present(self.id);
        let from = present(self.from);
        let to = present(self.to);
        let timestamp = present(self.timestamp);

        match (kind, id, from, to, timestamp) {
            (Some(kind), Some(id), Some(from), Some(to), Some(timestamp)) => Ok(Message {
                kind,
                id,
                timestamp,
                from,
                to,
                payload: self.payload.unwrap_or_default(),
                signature: self.signature,
            }),
            (kind, id, from, to, timestamp) => {
                let missing = [
                    ("type", kind.is_none()),
                    ("id", id.is_none()),
                    ("from", from.is_none()),
                    ("to", to.is_none()),
                    ("timestamp", timestamp.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, absent)| absent.then_some(name))
                .collect();
                Err(ValidationError::MissingFields(missing))
            }
        }
    }
}
