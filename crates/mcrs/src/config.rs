use clap::Parser;
use mcr_common::SharedSecret;
use std::net::SocketAddr;
use std::time::Duration;

/// Minimum shared-secret length accepted at startup.
pub const MIN_SECRET_LEN: usize = 16;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcrs")]
#[command(about = "Minecraft server relay")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on for peer WebSocket connections.
    #[arg(long, default_value = "0.0.0.0:8080", env = "MCRS_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the monitoring HTTP endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "MCRS_MONITOR")]
    pub monitor_addr: SocketAddr,
    /// Shared secret used to sign and verify every message.
    #[arg(long, env = "MCRS_SHARED_SECRET", hide_env_values = true)]
    pub shared_secret: String,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "10000", env = "MCRS_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "1048576", env = "MCRS_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "MCRS_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Interval between stale-entry sweeps in seconds.
    #[arg(long, default_value = "60", env = "MCRS_REAP_INTERVAL")]
    pub reap_interval: u64,
    /// Seconds without an inbound message before a peer is evicted.
    #[arg(long, default_value = "300", env = "MCRS_STALE_AFTER")]
    pub stale_after: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the monitoring endpoint.
    pub monitor_addr: SocketAddr,
    /// Process-wide HMAC key. Set once at startup.
    pub shared_secret: SharedSecret,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Interval between stale-entry sweeps in seconds.
    pub reap_interval: u64,
    /// Seconds without an inbound message before a peer is evicted.
    pub stale_after: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.shared_secret.len() < MIN_SECRET_LEN {
            return Err(format!(
                "shared_secret must be at least {MIN_SECRET_LEN} bytes"
            ));
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_message_size < 1024 {
            return Err("max_message_size must be at least 1024 bytes".to_string());
        }
        if self.max_message_size > 16 * 1024 * 1024 {
            return Err("max_message_size exceeds reasonable limit (16 MiB)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.reap_interval == 0 {
            return Err("reap_interval must be greater than 0".to_string());
        }
        if self.stale_after == 0 {
            return Err("stale_after must be greater than 0".to_string());
        }
        if self.stale_after < self.ping_interval {
            return Err("stale_after must not be shorter than ping_interval".to_string());
        }
        Ok(())
    }

    /// Sweep period of the stale reaper.
    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval)
    }

    /// Liveness limit applied by the stale reaper.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            monitor_addr: args.monitor_addr,
            shared_secret: SharedSecret::new(args.shared_secret),
            max_conns: args.max_conns,
            max_message_size: args.max_message_size,
            ping_interval: args.ping_interval,
            reap_interval: args.reap_interval,
            stale_after: args.stale_after,
        }
    }
}
