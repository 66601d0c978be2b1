use crate::admission::PeerClaims;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mcr_common::codec::format_timestamp;
use mcr_common::ServerId;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Payload keys that `server_register` may not overwrite.
const RESERVED_KEYS: &[&str] = &["serverId", "connectedAt", "lastSeen"];

/// Why the relay is closing a peer's transport from outside its own task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection registered under the same server id.
    Replaced,
    /// The reaper evicted the entry.
    Stale,
}

impl CloseReason {
    /// WebSocket close code sent to the peer.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Replaced => 1000,
            Self::Stale => 1001,
        }
    }

    /// Human-readable close reason.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Replaced => "replaced by newer connection",
            Self::Stale => "stale connection",
        }
    }
}

/// Why a queued send did not reach the peer's writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The connection task has exited.
    Closed,
    /// The connection's queue is full.
    Full,
}

/// Handle held in the registry, used to queue frames for a connection.
///
/// Close requests travel on their own watch channel, so a full data queue
/// never swallows them.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    tx: mpsc::Sender<Arc<str>>,
    close_tx: Arc<watch::Sender<Option<CloseReason>>>,
    /// Relay-local id of the connection, unique for the process lifetime.
    pub conn_id: u64,
}

impl PeerHandle {
    /// Wraps the sending half of a connection's outbound queue.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Arc<str>>, conn_id: u64) -> Self {
        let (close_tx, _) = watch::channel(None);
        Self {
            tx,
            close_tx: Arc::new(close_tx),
            conn_id,
        }
    }

    /// Queues a text frame without waiting.
    ///
    /// # Errors
    ///
    /// [`SendFailure`] if the queue is closed or full.
    pub fn send(&self, text: Arc<str>) -> Result<(), SendFailure> {
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Asks the connection task to close its transport. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// The pending close request, if any.
    #[must_use]
    pub fn close_requested(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }

    /// Receiver the connection task watches for close requests.
    #[must_use]
    pub fn close_signal(&self) -> watch::Receiver<Option<CloseReason>> {
        self.close_tx.subscribe()
    }

    /// Returns `true` while the connection task is still receiving.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// What is known about a connected peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerIdentity {
    /// Registry key.
    pub server_id: ServerId,
    /// Declared protocol version.
    pub version: Option<String>,
    /// Declared capabilities.
    pub capabilities: BTreeSet<String>,
    /// When the connection was admitted.
    pub connected_at: DateTime<Utc>,
    /// Last inbound message.
    pub last_seen: DateTime<Utc>,
    /// Free-form fields merged by `server_register`.
    pub extra: Map<String, Value>,
}

impl PeerIdentity {
    /// Builds the identity of a freshly admitted peer.
    #[must_use]
    pub fn new(claims: PeerClaims, now: DateTime<Utc>) -> Self {
        Self {
            server_id: claims.server_id,
            version: claims.version,
            capabilities: claims.capabilities.into_iter().collect(),
            connected_at: now,
            last_seen: now,
            extra: Map::new(),
        }
    }

    /// Shallow-merges `payload` into this identity.
    ///
    /// `version` and `capabilities` update the typed fields when well formed,
    /// reserved keys are ignored, everything else lands in [`extra`](Self::extra).
    pub fn merge(&mut self, payload: &Map<String, Value>) {
        for (key, value) in payload {
            match key.as_str() {
                k if RESERVED_KEYS.contains(&k) => {}
                "version" => match value {
                    Value::String(v) => self.version = Some(v.clone()),
                    Value::Null => self.version = None,
                    _ => {}
                },
                "capabilities" => {
                    if let Value::Array(items) = value {
                        self.capabilities = items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_owned)
                            .collect();
                    }
                }
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Public view, without the transport handle.
    #[must_use]
    pub fn view(&self) -> PeerView {
        PeerView {
            server_id: self.server_id.clone(),
            version: self.version.clone(),
            capabilities: self.capabilities.iter().cloned().collect(),
            connected_at: format_timestamp(self.connected_at),
            last_seen: format_timestamp(self.last_seen),
            extra: self.extra.clone(),
        }
    }
}

/// Serializable snapshot entry exposed to peers and the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    /// Registry key.
    pub server_id: ServerId,
    /// Declared protocol version.
    pub version: Option<String>,
    /// Declared capabilities, sorted.
    pub capabilities: Vec<String>,
    /// Admission time.
    pub connected_at: String,
    /// Last inbound message.
    pub last_seen: String,
    /// Fields merged by `server_register`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug)]
struct PeerEntry {
    identity: PeerIdentity,
    handle: PeerHandle,
}

/// Outcome of a connection removing its own registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The entry belonged to this connection and is gone.
    Removed,
    /// A newer connection owns the entry; it was left in place.
    Superseded,
    /// Nothing was registered under the id.
    Absent,
}

/// Concurrent server id → peer table.
///
/// Every operation locks only the shard holding the key, so touches, merges
/// and removals from different connection tasks and the reaper never
/// interleave on one entry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    peers: DashMap<ServerId, PeerEntry>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, returning the handle of any replaced connection.
    pub fn register(&self, identity: PeerIdentity, handle: PeerHandle) -> Option<PeerHandle> {
        let id = identity.server_id.clone();
        self.peers
            .insert(id, PeerEntry { identity, handle })
            .map(|old| old.handle)
    }

    /// Copy of the identity registered under `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PeerIdentity> {
        self.peers.get(id).map(|e| e.identity.clone())
    }

    /// Transport handle registered under `id`.
    #[must_use]
    pub fn handle(&self, id: &str) -> Option<PeerHandle> {
        self.peers.get(id).map(|e| e.handle.clone())
    }

    /// Sets `lastSeen` to now. Returns `false` if `id` is not registered.
    pub fn touch_last_seen(&self, id: &str) -> bool {
        self.touch_last_seen_at(id, Utc::now())
    }

    /// Sets `lastSeen` to `at`.
    pub fn touch_last_seen_at(&self, id: &str, at: DateTime<Utc>) -> bool {
        self.peers
            .get_mut(id)
            .map(|mut e| e.identity.last_seen = at)
            .is_some()
    }

    /// Sets `lastSeen` to now, only if `id` is still owned by connection `conn_id`.
    pub fn touch_if_current(&self, id: &str, conn_id: u64) -> bool {
        self.peers
            .get_mut(id)
            .filter(|e| e.handle.conn_id == conn_id)
            .map(|mut e| e.identity.last_seen = Utc::now())
            .is_some()
    }

    /// Shallow-merges a `server_register` payload. Returns `false` if `id` is not registered.
    pub fn merge(&self, id: &str, payload: &Map<String, Value>) -> bool {
        self.peers
            .get_mut(id)
            .map(|mut e| e.identity.merge(payload))
            .is_some()
    }

    /// Unconditional removal.
    pub fn remove(&self, id: &str) -> Option<PeerIdentity> {
        self.peers.remove(id).map(|(_, e)| e.identity)
    }

    /// Remove the entry only if it still belongs to connection `conn_id`.
    pub fn remove_if_current(&self, id: &str, conn_id: u64) -> Removal {
        if self
            .peers
            .remove_if(id, |_, e| e.handle.conn_id == conn_id)
            .is_some()
        {
            Removal::Removed
        } else if self.peers.contains_key(id) {
            Removal::Superseded
        } else {
            Removal::Absent
        }
    }

    /// Public views of every entry, ordered by server id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerView> {
        let mut views: Vec<PeerView> = self.peers.iter().map(|e| e.identity.view()).collect();
        views.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        views
    }

    /// Number of registered peers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.peers.len()
    }

    /// Returns `true` if no peer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Handles of every peer except `exclude`.
    #[must_use]
    pub fn handles_except(&self, exclude: &str) -> Vec<(ServerId, PeerHandle)> {
        self.peers
            .iter()
            .filter(|e| e.key() != exclude)
            .map(|e| (e.key().clone(), e.handle.clone()))
            .collect()
    }

    /// Removes entries whose `lastSeen` is more than `stale_after` before `now`.
    ///
    /// An entry touched between the scan and the removal is kept.
    pub fn evict_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Vec<(ServerId, PeerHandle)> {
        let limit = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        let is_stale = |e: &PeerEntry| now.signed_duration_since(e.identity.last_seen) > limit;

        let candidates: Vec<ServerId> = self
            .peers
            .iter()
            .filter(|e| is_stale(e.value()))
            .map(|e| e.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter_map(|id| self.peers.remove_if(&id, |_, e| is_stale(e)))
            .map(|(id, e)| (id, e.handle))
            .collect()
    }
}
