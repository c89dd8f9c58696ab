use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::job::JobSummary;
use crate::resources::WorkerNode;
use crate::services::analytics::SystemMetrics;

/// A named, owned, time-bounded reservation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributedLock {
    pub key: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DistributedLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Immutable capture of orchestrator state.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub taken_at: DateTime<Utc>,
    pub jobs: Vec<JobSummary>,
    pub nodes: Vec<WorkerNode>,
    pub metrics: SystemMetrics,
    pub locks: Vec<DistributedLock>,
}

/// Distributed locking and snapshot persistence.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Take `key` for `owner`, or `None` while someone else holds it.
    async fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Option<DistributedLock>;

    /// Release `key` if `owner` holds it. Returns whether a lock was removed.
    async fn release_lock(&self, key: &str, owner: &str) -> bool;

    async fn save_snapshot(&self, snapshot: StateSnapshot) -> Result<()>;

    /// Currently held, unexpired locks.
    async fn locks(&self) -> Vec<DistributedLock>;
}

const DEFAULT_SNAPSHOT_HISTORY: usize = 16;

/// Process-local coordinator. Keeps the last few snapshots in memory and,
/// if configured, writes the latest one to a JSON file.
#[derive(Debug)]
pub struct InMemoryCoordinator {
    locks: Mutex<HashMap<String, DistributedLock>>,
    snapshots: Mutex<VecDeque<StateSnapshot>>,
    history: usize,
    snapshot_path: Option<PathBuf>,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(VecDeque::new()),
            history: DEFAULT_SNAPSHOT_HISTORY,
            snapshot_path: None,
        }
    }

    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub async fn latest_snapshot(&self) -> Option<StateSnapshot> {
        self.snapshots.lock().await.back().cloned()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.lock().await.len()
    }

    async fn persist(&self, snapshot: &StateSnapshot) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl CoordinationService for InMemoryCoordinator {
    async fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Option<DistributedLock> {
        let now = Utc::now();
        let mut locks = self.locks.lock().await;
        if let Some(held) = locks.get(key) {
            if !held.is_expired(now) && held.owner != owner {
                tracing::debug!(key, owner, holder = %held.owner, "Lock busy");
                return None;
            }
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let lock = DistributedLock {
            key: key.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        locks.insert(key.to_string(), lock.clone());
        Some(lock)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> bool {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(held) if held.owner == owner => {
                locks.remove(key);
                true
            }
            _ => false,
        }
    }

    async fn save_snapshot(&self, snapshot: StateSnapshot) -> Result<()> {
        self.persist(&snapshot).await?;
        let mut snapshots = self.snapshots.lock().await;
        snapshots.push_back(snapshot);
        while snapshots.len() > self.history {
            snapshots.pop_front();
        }
        Ok(())
    }

    async fn locks(&self) -> Vec<DistributedLock> {
        let now = Utc::now();
        let mut locks = self.locks.lock().await;
        locks.retain(|_, l| !l.is_expired(now));
        let mut held: Vec<DistributedLock> = locks.values().cloned().collect();
        held.sort_by(|a, b| a.key.cmp(&b.key));
        held
    }
}
