//! Minecraft server relay: authenticated, routed WebSocket messaging between game servers.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Connection admission and the pluggable authenticator.
pub mod admission;
/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay server operations.
pub mod error;
/// Monitoring HTTP endpoint and Prometheus metrics.
pub mod monitor;
/// Background eviction of peers that stopped talking.
pub mod reaper;
/// Server id keyed table of connected peers.
pub mod registry;
/// Per-message dispatch between peers.
pub mod router;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
