//! Agent identity and running counters shared by every worker.
//!
//! Both live behind one reader/writer lock: the agent id is read on every
//! event, counters are bumped on every event and batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub events_collected: u64,
    pub events_filtered: u64,
    pub events_dropped: u64,
    pub events_sent: u64,
    pub events_failed: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub heartbeats_failed: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_inventory: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Assigned by the server; empty until registration succeeds.
    pub agent_id: String,
    pub hostname: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

impl AgentIdentity {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            agent_id: String::new(),
            hostname: hostname.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

#[derive(Debug)]
struct Inner {
    identity: AgentIdentity,
    stats: Stats,
}

/// Cheap-to-clone handle; every clone sees the same state.
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<RwLock<Inner>>,
}

impl SharedState {
    pub fn new(identity: AgentIdentity) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                identity,
                stats: Stats::default(),
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn agent_id(&self) -> String {
        self.read().identity.agent_id.clone()
    }

    pub fn is_registered(&self) -> bool {
        !self.read().identity.agent_id.is_empty()
    }

    /// Set once; later calls with a different id are ignored and return false.
    pub fn set_agent_id(&self, agent_id: impl Into<String>) -> bool {
        let agent_id = agent_id.into();
        let mut inner = self.write();
        if inner.identity.agent_id.is_empty() {
            inner.identity.agent_id = agent_id;
            true
        } else {
            inner.identity.agent_id == agent_id
        }
    }

    pub fn identity(&self) -> AgentIdentity {
        self.read().identity.clone()
    }

    /// Copy of the counters.
    pub fn snapshot(&self) -> Stats {
        self.read().stats.clone()
    }

    /// Apply a mutation to the counters under the write lock.
    pub fn update<F: FnOnce(&mut Stats)>(&self, f: F) {
        f(&mut self.write().stats);
    }

    pub fn record_collected(&self, n: u64) {
        self.update(|s| s.events_collected += n);
    }

    pub fn record_filtered(&self, n: u64) {
        self.update(|s| s.events_filtered += n);
    }

    pub fn record_dropped(&self, n: u64) {
        self.update(|s| s.events_dropped += n);
    }

    pub fn record_batch_sent(&self, events: u64) {
        self.update(|s| {
            s.events_sent += events;
            s.batches_sent += 1;
        });
    }

    pub fn record_batch_failed(&self, events: u64) {
        self.update(|s| {
            s.events_failed += events;
            s.batches_failed += 1;
        });
    }

    pub fn record_heartbeat(&self, at: DateTime<Utc>) {
        self.update(|s| s.last_heartbeat = Some(at));
    }

    pub fn record_heartbeat_failed(&self) {
        self.update(|s| s.heartbeats_failed += 1);
    }

    pub fn record_inventory(&self, at: DateTime<Utc>) {
        self.update(|s| s.last_inventory = Some(at));
    }
}
