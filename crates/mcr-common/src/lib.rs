//! Common types and utilities shared by the relay and its peers.
//!
//! This crate provides:
//! - JSON wire messages and decoding ([`message`])
//! - HMAC-SHA256 signing helpers ([`crypto`])
//! - Message construction and validation ([`codec`])
//! - Protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod crypto;
pub mod message;
pub mod types;

pub use codec::{InboundError, MessageCodec};
pub use crypto::SharedSecret;
pub use message::{Message, MessageType};
pub use types::ServerId;
