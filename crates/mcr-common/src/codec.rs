//! Message construction, signing and validation against the shared secret.

use crate::crypto::{self, SharedSecret, SignedFields};
use crate::message::{decode, CodecError, Message, MessageType, ValidationError};
use crate::types::FRESHNESS_WINDOW;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Formats an instant the way every relay timestamp is written.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn signed_fields(message: &Message) -> SignedFields<'_> {
    SignedFields {
        kind: message.kind.as_str(),
        timestamp: &message.timestamp,
        from: &message.from,
        to: &message.to,
        payload: &message.payload,
    }
}

/// Signs, verifies and builds messages with one shared secret.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    secret: SharedSecret,
}

impl MessageCodec {
    /// Creates a codec keyed by `secret`.
    #[must_use]
    pub const fn new(secret: SharedSecret) -> Self {
        Self { secret }
    }

    /// Computes the signature of `message`, ignoring any signature it already carries.
    #[must_use]
    pub fn sign(&self, message: &Message) -> String {
        crypto::sign(&self.secret, &signed_fields(message))
    }

    /// Builds a relay-style message with a fresh id, the current time and an
    /// attached signature.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcr_common::codec::MessageCodec;
    /// use mcr_common::crypto::SharedSecret;
    /// use mcr_common::message::MessageType;
    ///
    /// let codec = MessageCodec::new(SharedSecret::new("0123456789abcdef"));
    /// let msg = codec.create_message(MessageType::Heartbeat, "lobby-1", "relay", None);
    /// assert!(msg.signature.is_some());
    /// assert!(codec.validate(msg).is_ok());
    /// ```
    #[must_use]
    pub fn create_message(
        &self,
        kind: MessageType,
        from: &str,
        to: &str,
        payload: Option<Map<String, Value>>,
    ) -> Message {
        self.create_message_at(kind, from, to, payload, Utc::now())
    }

    /// [`create_message`](Self::create_message) with an explicit timestamp.
    #[must_use]
    pub fn create_message_at(
        &self,
        kind: MessageType,
        from: &str,
        to: &str,
        payload: Option<Map<String, Value>>,
        at: DateTime<Utc>,
    ) -> Message {
        let mut message = Message {
            kind,
            id: Uuid::new_v4().to_string(),
            timestamp: format_timestamp(at),
            from: from.to_owned(),
            to: to.to_owned(),
            payload: payload.unwrap_or_default(),
            signature: None,
        };
        message.signature = Some(self.sign(&message));
        message
    }

    /// Validates a message against the current clock.
    ///
    /// # Errors
    ///
    /// See [`validate_at`](Self::validate_at).
    pub fn validate(&self, message: Message) -> Result<Message, ValidationError> {
        self.validate_at(message, Utc::now())
    }

    /// Checks freshness relative to `now` and, only when a signature is
    /// present, that it verifies. Unsigned messages are accepted.
    ///
    /// # Errors
    ///
    /// [`ValidationError::InvalidTimestamp`], [`ValidationError::StaleTimestamp`]
    /// or [`ValidationError::BadSignature`].
    pub fn validate_at(
        &self,
        message: Message,
        now: DateTime<Utc>,
    ) -> Result<Message, ValidationError> {
        let sent = DateTime::parse_from_rfc3339(&message.timestamp)
            .map_err(|_| ValidationError::InvalidTimestamp)?
            .with_timezone(&Utc);

        let skew_ms = (now - sent).num_milliseconds().saturating_abs();
        let window_ms = i64::try_from(FRESHNESS_WINDOW.as_millis()).unwrap_or(i64::MAX);
        if skew_ms > window_ms {
            return Err(ValidationError::StaleTimestamp { skew_ms });
        }

        if let Some(signature) = &message.signature {
            if !crypto::verify(&self.secret, &signed_fields(&message), signature) {
                return Err(ValidationError::BadSignature);
            }
        }

        Ok(message)
    }

    /// Decodes a frame and validates it in one step.
    ///
    /// # Errors
    ///
    /// [`InboundError::Decode`] for unparseable frames, otherwise
    /// [`InboundError::Invalid`].
    pub fn decode_validated(&self, bytes: &[u8]) -> Result<Message, InboundError> {
        let message = decode(bytes)?.into_message()?;
        Ok(self.validate(message)?)
    }

    /// Serializes a message to its JSON text form.
    #[must_use]
    pub fn encode(message: &Message) -> String {
        serde_json::to_string(message).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Either stage of inbound processing failing.
#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    /// Not a message object.
    #[error(transparent)]
    Decode(#[from] CodecError),
    /// Decoded but rejected.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl InboundError {
    /// Wire error code reported back to the sender.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Decode(e) => e.code(),
            Self::Invalid(e) => e.code(),
        }
    }
}
