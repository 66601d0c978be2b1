//! Core type definitions and protocol constants for the relay.

use std::time::Duration;

/// Identifier a peer registers under. Unique across the registry.
pub type ServerId = String;

/// `from` value on every relay-originated message.
pub const RELAY_ID: &str = "relay";

/// `to` value addressing every connected peer.
pub const BROADCAST: &str = "broadcast";

/// Maximum tolerated skew between a message timestamp and receipt, in either direction.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Minimum accepted length of an admission bearer token.
pub const MIN_CREDENTIAL_LEN: usize = 10;

/// Handshake header names read during admission.
pub mod header {
    /// `Authorization: Bearer <token>`.
    pub const AUTHORIZATION: &str = "authorization";
    /// Peer identifier, required.
    pub const SERVER_ID: &str = "x-server-id";
    /// Declared peer protocol version, optional.
    pub const SERVER_VERSION: &str = "x-server-version";
    /// Comma-separated capability list, optional.
    pub const CAPABILITIES: &str = "x-server-capabilities";
}

/// Codes carried in `error` message payloads.
pub mod error_code {
    /// The frame was not a JSON message object.
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    /// One of `type`, `id`, `from`, `to`, `timestamp` was absent.
    pub const MISSING_FIELDS: &str = "MISSING_FIELDS";
    /// Timestamp outside the freshness window.
    pub const STALE_TIMESTAMP: &str = "STALE_TIMESTAMP";
    /// Timestamp present but not RFC 3339.
    pub const INVALID_TIMESTAMP: &str = "INVALID_TIMESTAMP";
    /// Signature present but did not verify.
    pub const INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";
}

/// Codes carried in failed `teleport_response` payloads.
pub mod routing_code {
    /// Target server is not in the registry.
    pub const SERVER_NOT_FOUND: &str = "SERVER_NOT_FOUND";
    /// Target is registered but its transport could not take the message.
    pub const TARGET_UNAVAILABLE: &str = "TARGET_UNAVAILABLE";
}
