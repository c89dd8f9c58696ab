use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::NodeProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
    Maintenance,
}

impl HealthStatus {
    /// Healthy and degraded nodes may receive work.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Offline => write!(f, "offline"),
            HealthStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Resources a job needs. Units: cpu millicores, memory/storage MiB,
/// bandwidth Mbps, accelerator units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub storage_mb: u64,
    pub bandwidth_mbps: u64,
    #[serde(default)]
    pub gpu_units: u64,
}

impl ResourceRequirements {
    pub fn new(cpu_millis: u64, memory_mb: u64, storage_mb: u64, bandwidth_mbps: u64) -> Self {
        Self {
            cpu_millis,
            memory_mb,
            storage_mb,
            bandwidth_mbps,
            gpu_units: 0,
        }
    }

    pub fn with_gpu(mut self, units: u64) -> Self {
        self.gpu_units = units;
        self
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Component-wise `self <= other`.
    pub fn fits_within(&self, other: &ResourceRequirements) -> bool {
        self.cpu_millis <= other.cpu_millis
            && self.memory_mb <= other.memory_mb
            && self.storage_mb <= other.storage_mb
            && self.bandwidth_mbps <= other.bandwidth_mbps
            && self.gpu_units <= other.gpu_units
    }

    pub fn saturating_add(&self, other: &ResourceRequirements) -> ResourceRequirements {
        ResourceRequirements {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            storage_mb: self.storage_mb.saturating_add(other.storage_mb),
            bandwidth_mbps: self.bandwidth_mbps.saturating_add(other.bandwidth_mbps),
            gpu_units: self.gpu_units.saturating_add(other.gpu_units),
        }
    }
}

/// One allocatable dimension. `available` is derived, so
/// `used + available == total` always holds as long as `used <= total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCounter {
    total: u64,
    used: u64,
}

impl ResourceCounter {
    pub fn new(total: u64) -> Self {
        Self { total, used: 0 }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn available(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }

    /// Fraction of the dimension in use. A zero-capacity dimension counts as fully used.
    pub fn usage_ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.used as f64 / self.total as f64
        }
    }

    pub fn available_ratio(&self) -> f64 {
        1.0 - self.usage_ratio()
    }

    /// Reserve `amount`. Refuses (returns false) rather than exceed the total.
    pub fn reserve(&mut self, amount: u64) -> bool {
        if amount > self.available() {
            return false;
        }
        self.used += amount;
        true
    }

    /// Return `amount`, clamping at zero to tolerate drift.
    pub fn release(&mut self, amount: u64) {
        self.used = self.used.saturating_sub(amount);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    pub cpu: ResourceCounter,
    pub memory: ResourceCounter,
    pub storage: ResourceCounter,
    pub bandwidth: ResourceCounter,
    pub gpu: ResourceCounter,
    pub latency_ms: f64,
}

impl NodeResources {
    pub fn from_profile(profile: &NodeProfile) -> Self {
        Self {
            cpu: ResourceCounter::new(profile.cpu_millis),
            memory: ResourceCounter::new(profile.memory_mb),
            storage: ResourceCounter::new(profile.storage_mb),
            bandwidth: ResourceCounter::new(profile.bandwidth_mbps),
            gpu: ResourceCounter::new(profile.gpu_units),
            latency_ms: profile.latency_ms,
        }
    }

    pub fn available(&self) -> ResourceRequirements {
        ResourceRequirements {
            cpu_millis: self.cpu.available(),
            memory_mb: self.memory.available(),
            storage_mb: self.storage.available(),
            bandwidth_mbps: self.bandwidth.available(),
            gpu_units: self.gpu.available(),
        }
    }

    pub fn total(&self) -> ResourceRequirements {
        ResourceRequirements {
            cpu_millis: self.cpu.total(),
            memory_mb: self.memory.total(),
            storage_mb: self.storage.total(),
            bandwidth_mbps: self.bandwidth.total(),
            gpu_units: self.gpu.total(),
        }
    }

    pub fn can_fit(&self, req: &ResourceRequirements) -> bool {
        req.fits_within(&self.available())
    }

    /// Reserve every dimension or none of them.
    pub fn reserve(&mut self, req: &ResourceRequirements) -> bool {
        if !self.can_fit(req) {
            return false;
        }
        self.cpu.reserve(req.cpu_millis);
        self.memory.reserve(req.memory_mb);
        self.storage.reserve(req.storage_mb);
        self.bandwidth.reserve(req.bandwidth_mbps);
        self.gpu.reserve(req.gpu_units);
        true
    }

    pub fn release(&mut self, req: &ResourceRequirements) {
        self.cpu.release(req.cpu_millis);
        self.memory.release(req.memory_mb);
        self.storage.release(req.storage_mb);
        self.bandwidth.release(req.bandwidth_mbps);
        self.gpu.release(req.gpu_units);
    }

    /// `used + available == total` on every dimension.
    pub fn is_consistent(&self) -> bool {
        [self.cpu, self.memory, self.storage, self.bandwidth, self.gpu]
            .iter()
            .all(|c| c.used() + c.available() == c.total())
    }
}

/// A worker capable of executing workflow steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    pub id: String,
    pub hostname: String,
    pub status: HealthStatus,
    pub resources: NodeResources,
    pub assigned_jobs: HashSet<Uuid>,
    /// Rolling score in `0.0..=1.0`, higher is better.
    pub performance_score: f64,
    pub tags: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerNode {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, profile: &NodeProfile) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            status: HealthStatus::Healthy,
            resources: NodeResources::from_profile(profile),
            assigned_jobs: HashSet::new(),
            performance_score: 1.0,
            tags: BTreeSet::new(),
            registered_at: Utc::now(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_performance_score(mut self, score: f64) -> Self {
        self.performance_score = score.clamp(0.0, 1.0);
        self
    }

    pub fn with_status(mut self, status: HealthStatus) -> Self {
        self.status = status;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn cpu_usage(&self) -> f64 {
        self.resources.cpu.usage_ratio()
    }

    pub fn memory_available_ratio(&self) -> f64 {
        self.resources.memory.available_ratio()
    }

    pub fn job_count(&self) -> usize {
        self.assigned_jobs.len()
    }
}
