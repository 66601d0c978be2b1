use crate::monitor::counters;
use crate::registry::{CloseReason, ConnectionRegistry};
use chrono::{DateTime, Utc};
use mcr_common::ServerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Periodically evicts peers that have not sent anything for `stale_after`.
///
/// Eviction is silent: remaining peers get no leave notification. The evicted
/// transport is asked to close.
#[derive(Debug, Clone)]
pub struct StaleReaper {
    registry: Arc<ConnectionRegistry>,
    period: Duration,
    stale_after: Duration,
}

impl StaleReaper {
    /// Create a reaper sweeping `registry` every `period`.
    #[must_use]
    pub const fn new(
        registry: Arc<ConnectionRegistry>,
        period: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            registry,
            period,
            stale_after,
        }
    }

    /// Runs one sweep against `now`, returning the evicted server ids.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<ServerId> {
        let evicted = self.registry.evict_stale(now, self.stale_after);
        if evicted.is_empty() {
            return Vec::new();
        }

        counters::reaper_evictions_total(evicted.len() as u64);
        evicted
            .into_iter()
            .map(|(server_id, handle)| {
                info!(%server_id, conn_id = handle.conn_id, "evicted stale peer");
                handle.close(CloseReason::Stale);
                server_id
            })
            .collect()
    }

    /// Spawns the sweep loop. It stops when `shutdown` changes or its sender is dropped.
    #[must_use]
    pub fn spawn(self, mut shutdown: watch::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.sweep(Utc::now());
                        debug!(evicted = evicted.len(), remaining = self.registry.size(), "reaper sweep");
                    }
                    _ = shutdown.changed() => {
                        debug!("reaper stopped");
                        break;
                    }
                }
            }
        })
    }
}
