//! HMAC-SHA256 message authentication.
//!
//! Every relay-originated message carries a base64 signature over the
//! canonical string `type|timestamp|from|to|payload_json`, keyed by the
//! process-wide shared secret. Peers may sign their own messages with the
//! same secret; the relay verifies those signatures when present.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// The shared secret used for every signing and verification operation.
///
/// Cheap to clone; the key bytes are shared.
#[derive(Clone)]
pub struct SharedSecret(Arc<[u8]>);

impl SharedSecret {
    /// Wraps raw key bytes.
    #[must_use]
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for an empty key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        match HmacSha256::new_from_slice(&self.0) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac key length is unrestricted"),
        }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// The fields covered by a signature, borrowed from a message.
#[derive(Debug, Clone, Copy)]
pub struct SignedFields<'a> {
    /// Wire name of the message type.
    pub kind: &'a str,
    /// Timestamp exactly as it appears on the wire.
    pub timestamp: &'a str,
    /// Sender id.
    pub from: &'a str,
    /// Recipient id.
    pub to: &'a str,
    /// Payload object.
    pub payload: &'a Map<String, Value>,
}

/// Builds `type|timestamp|from|to|payload_json`.
///
/// `payload_json` is the compact `serde_json` rendering; object keys come
/// out sorted, so the string is stable for equal payloads.
#[must_use]
pub fn canonical_string(fields: &SignedFields<'_>) -> String {
    let payload = Value::Object(fields.payload.clone()).to_string();
    format!(
        "{}|{}|{}|{}|{}",
        fields.kind, fields.timestamp, fields.from, fields.to, payload
    )
}

/// Computes the base64 HMAC-SHA256 signature of the canonical string.
///
/// # Examples
///
/// ```
/// use mcr_common::crypto::{sign, SharedSecret, SignedFields};
/// use serde_json::Map;
///
/// let secret = SharedSecret::new("correct horse battery staple");
/// let payload = Map::new();
/// let fields = SignedFields {
///     kind: "heartbeat",
///     timestamp: "2024-05-01T12:00:00.000Z",
///     from: "lobby-1",
///     to: "relay",
///     payload: &payload,
/// };
/// assert_eq!(sign(&secret, &fields), sign(&secret, &fields));
/// ```
#[must_use]
pub fn sign(secret: &SharedSecret, fields: &SignedFields<'_>) -> String {
    let mut mac = secret.mac();
    mac.update(canonical_string(fields).as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Verifies a base64 signature in constant time.
///
/// Returns `false` for signatures that are not valid base64.
#[must_use]
pub fn verify(secret: &SharedSecret, fields: &SignedFields<'_>, signature: &str) -> bool {
    let Ok(raw) = BASE64.decode(signature.as_bytes()) else {
        return false;
    };
    let mut mac = secret.mac();
    mac.update(canonical_string(fields).as_bytes());
    mac.verify_slice(&raw).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Map<String, Value> {
        let Value::Object(map) = json!({"player": "Steve", "world": "nether"}) else {
            unreachable!()
        };
        map
    }

    fn fields(payload: &Map<String, Value>) -> SignedFields<'_> {
        SignedFields {
            kind: "teleport_request",
            timestamp: "2024-05-01T12:00:00.000Z",
            from: "lobby-1",
            to: "survival-1",
            payload,
        }
    }

    #[test]
    fn canonical_string_is_pipe_joined() {
        let p = payload();
        assert_eq!(
            canonical_string(&fields(&p)),
            r#"teleport_request|2024-05-01T12:00:00.000Z|lobby-1|survival-1|{"player":"Steve","world":"nether"}"#
        );
    }

    #[test]
    fn canonical_string_with_empty_payload() {
        let p = Map::new();
        assert!(canonical_string(&fields(&p)).ends_with("|{}"));
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let secret = SharedSecret::new("0123456789abcdef");
        let p = payload();
        let sig = sign(&secret, &fields(&p));
        assert!(verify(&secret, &fields(&p), &sig));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let p = payload();
        let sig = sign(&SharedSecret::new("secret-a-secret-a"), &fields(&p));
        assert!(!verify(
            &SharedSecret::new("secret-b-secret-b"),
            &fields(&p),
            &sig
        ));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let secret = SharedSecret::new("0123456789abcdef");
        let p = payload();
        assert!(!verify(&secret, &fields(&p), "not base64 !!"));
        assert!(!verify(&secret, &fields(&p), ""));
    }

    #[test]
    fn signature_is_base64_of_32_bytes() {
        let secret = SharedSecret::new("0123456789abcdef");
        let p = payload();
        let raw = BASE64.decode(sign(&secret, &fields(&p))).unwrap();
        assert_eq!(raw.len(), 32);
    }

    #[test]
    fn debug_does_not_leak_key() {
        let secret = SharedSecret::new("super-secret-value");
        assert_eq!(format!("{secret:?}"), "SharedSecret(..)");
    }
}
