use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::ResourcePoolConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{AlertSeverity, EventBus, NodeEvent, ResourceAlert, ResourceEvent};
use crate::resources::node::{HealthStatus, ResourceRequirements, WorkerNode};

/// Tag carried by nodes that `scale_up` provisioned and `scale_down` may remove.
pub const ELASTIC_TAG: &str = "elastic";

/// Weight of a new sample in the rolling performance score.
const PERFORMANCE_EMA_ALPHA: f64 = 0.3;

/// A job's grant on a single node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceAllocation {
    pub job_id: Uuid,
    pub node_id: String,
    pub granted: ResourceRequirements,
    pub allocated_at: DateTime<Utc>,
}

/// Pool-wide usage fraction per dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Utilization {
    pub cpu: f64,
    pub memory: f64,
    pub storage: f64,
    pub bandwidth: f64,
    pub gpu: f64,
}

impl Utilization {
    /// The busiest dimension and its usage.
    pub fn peak(&self) -> (&'static str, f64) {
        [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("storage", self.storage),
            ("bandwidth", self.bandwidth),
            ("gpu", self.gpu),
        ]
        .into_iter()
        .fold(("cpu", 0.0), |best, cur| if cur.1 > best.1 { cur } else { best })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSummary {
    pub node_count: usize,
    pub schedulable_nodes: usize,
    pub total: ResourceRequirements,
    pub available: ResourceRequirements,
    pub active_allocations: usize,
}

/// Tracks node inventory and per-job resource grants.
///
/// All mutation goes through `&mut self`; owners share the pool behind a
/// single lock, which serializes allocate/release/health/scale operations
/// and keeps `used + available == total` on every node.
#[derive(Debug)]
pub struct ResourcePool {
    config: ResourcePoolConfig,
    nodes: BTreeMap<String, WorkerNode>,
    allocations: HashMap<Uuid, ResourceAllocation>,
    /// Nodes whose status was set by an external health signal; the
    /// monitoring tick leaves them alone until a healthy signal arrives.
    pinned: HashSet<String>,
    total: ResourceRequirements,
    available: ResourceRequirements,
    alert_level: Option<AlertSeverity>,
    events: EventBus,
}

impl ResourcePool {
    pub fn new(config: ResourcePoolConfig, events: EventBus) -> Self {
        Self {
            config,
            nodes: BTreeMap::new(),
            allocations: HashMap::new(),
            pinned: HashSet::new(),
            total: ResourceRequirements::default(),
            available: ResourceRequirements::default(),
            alert_level: None,
            events,
        }
    }

    pub fn config(&self) -> &ResourcePoolConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Inventory
    // ------------------------------------------------------------------

    pub fn register_node(&mut self, mut node: WorkerNode) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(OrchestratorError::DuplicateNode(node.id));
        }
        // Inventory arrives without grants; usage is owned by this pool.
        node.assigned_jobs.clear();
        let node_id = node.id.clone();
        tracing::info!(
            node_id = %node_id,
            hostname = %node.hostname,
            status = %node.status,
            "Node registered"
        );
        self.nodes.insert(node_id.clone(), node);
        self.recompute_aggregates();
        self.events.nodes().publish(NodeEvent::Joined { node_id });
        Ok(())
    }

    /// Remove a node and drop the grants it held. Returns the jobs that were
    /// running there so the caller can place them elsewhere.
    pub fn unregister_node(&mut self, node_id: &str) -> Result<Vec<Uuid>> {
        let node = self
            .nodes
            .remove(node_id)
            .ok_or_else(|| OrchestratorError::NodeNotFound(node_id.to_string()))?;
        self.pinned.remove(node_id);

        let mut orphaned: Vec<Uuid> = node.assigned_jobs.iter().copied().collect();
        orphaned.sort();
        self.allocations.retain(|_, a| a.node_id != node_id);
        self.recompute_aggregates();

        tracing::info!(node_id, orphaned = orphaned.len(), "Node unregistered");
        self.events.nodes().publish(NodeEvent::Left {
            node_id: node_id.to_string(),
            orphaned_jobs: orphaned.clone(),
        });
        Ok(orphaned)
    }

    pub fn node(&self, node_id: &str) -> Option<&WorkerNode> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &WorkerNode> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn schedulable_nodes(&self) -> Vec<&WorkerNode> {
        self.nodes
            .values()
            .filter(|n| n.status.is_schedulable())
            .collect()
    }

    pub fn jobs_on(&self, node_id: &str) -> Vec<Uuid> {
        let mut jobs: Vec<Uuid> = self
            .nodes
            .get(node_id)
            .map(|n| n.assigned_jobs.iter().copied().collect())
            .unwrap_or_default();
        jobs.sort();
        jobs
    }

    /// Schedulable nodes able to host `req` for `job_id`, as the job sees
    /// them: a grant it already holds is handed back on the returned copy of
    /// its node, so scoring treats that capacity as free.
    pub fn candidates_for(&self, job_id: Uuid, req: &ResourceRequirements) -> Vec<WorkerNode> {
        let current = self.allocations.get(&job_id);
        self.nodes
            .values()
            .filter(|n| n.status.is_schedulable())
            .filter_map(|n| {
                let mut view = n.clone();
                if let Some(a) = current.filter(|a| a.node_id == n.id) {
                    view.resources.release(&a.granted);
                    view.assigned_jobs.remove(&job_id);
                }
                view.resources.can_fit(req).then_some(view)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Reserve `req` for `job_id` on the best-scoring node.
    pub fn allocate(
        &mut self,
        job_id: Uuid,
        req: &ResourceRequirements,
    ) -> Result<ResourceAllocation> {
        if self.allocations.contains_key(&job_id) {
            return Err(OrchestratorError::AlreadyAllocated(job_id));
        }
        if !req.fits_within(&self.available) {
            return Err(OrchestratorError::ResourceExhausted(format!(
                "requested {:?}, pool has {:?} available",
                req, self.available
            )));
        }

        let best = self
            .nodes
            .values()
            .filter(|n| n.status.is_schedulable() && n.resources.can_fit(req))
            .map(|n| (self.score_node(n, req), n.id.clone()))
            .fold(None::<(f64, String)>, |best, cur| match best {
                Some(b) if b.0 >= cur.0 => Some(b),
                _ => Some(cur),
            });

        let Some((score, node_id)) = best else {
            return Err(OrchestratorError::ResourceExhausted(
                "no single node can satisfy the request".to_string(),
            ));
        };
        tracing::debug!(job_id = %job_id, node_id = %node_id, score, "Selected node for allocation");
        self.grant(job_id, &node_id, req)
    }

    /// Reserve `req` for `job_id` on a specific node.
    pub fn allocate_on(
        &mut self,
        job_id: Uuid,
        node_id: &str,
        req: &ResourceRequirements,
    ) -> Result<ResourceAllocation> {
        if self.allocations.contains_key(&job_id) {
            return Err(OrchestratorError::AlreadyAllocated(job_id));
        }
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| OrchestratorError::NodeNotFound(node_id.to_string()))?;
        if !node.status.is_schedulable() {
            return Err(OrchestratorError::NoNodeAvailable(format!(
                "node {} is {}",
                node_id, node.status
            )));
        }
        if !node.resources.can_fit(req) {
            return Err(OrchestratorError::ResourceExhausted(format!(
                "node {} cannot fit {:?}",
                node_id, req
            )));
        }
        self.grant(job_id, node_id, req)
    }

    /// Move an existing grant to `target`. Either the whole grant moves or
    /// nothing changes.
    pub fn transfer(&mut self, job_id: Uuid, target: &str) -> Result<ResourceAllocation> {
        let current = self
            .allocations
            .get(&job_id)
            .cloned()
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        if current.node_id == target {
            return Ok(current);
        }
        let node = self
            .nodes
            .get(target)
            .ok_or_else(|| OrchestratorError::NodeNotFound(target.to_string()))?;
        if !node.status.is_schedulable() {
            return Err(OrchestratorError::NoNodeAvailable(format!(
                "node {} is {}",
                target, node.status
            )));
        }
        if !node.resources.can_fit(&current.granted) {
            return Err(OrchestratorError::ResourceExhausted(format!(
                "node {} cannot take the grant of job {}",
                target, job_id
            )));
        }
        self.release(job_id);
        self.grant(job_id, target, &current.granted)
    }

    fn grant(
        &mut self,
        job_id: Uuid,
        node_id: &str,
        req: &ResourceRequirements,
    ) -> Result<ResourceAllocation> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| OrchestratorError::NodeNotFound(node_id.to_string()))?;
        if !node.resources.reserve(req) {
            return Err(OrchestratorError::ResourceExhausted(format!(
                "node {} cannot fit {:?}",
                node_id, req
            )));
        }
        node.assigned_jobs.insert(job_id);

        let allocation = ResourceAllocation {
            job_id,
            node_id: node_id.to_string(),
            granted: *req,
            allocated_at: Utc::now(),
        };
        self.allocations.insert(job_id, allocation.clone());
        self.recompute_aggregates();
        tracing::debug!(job_id = %job_id, node_id, "Resources allocated");
        Ok(allocation)
    }

    /// Return a job's grant to its node. Releasing an unknown or already
    /// released job is a no-op.
    pub fn release(&mut self, job_id: Uuid) -> Option<ResourceAllocation> {
        let allocation = self.allocations.remove(&job_id)?;
        if let Some(node) = self.nodes.get_mut(&allocation.node_id) {
            node.resources.release(&allocation.granted);
            node.assigned_jobs.remove(&job_id);
        }
        self.recompute_aggregates();
        tracing::debug!(job_id = %job_id, node_id = %allocation.node_id, "Resources released");
        Some(allocation)
    }

    pub fn allocation(&self, job_id: Uuid) -> Option<&ResourceAllocation> {
        self.allocations.get(&job_id)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &ResourceAllocation> {
        self.allocations.values()
    }

    /// Allocation score: favours performance, cpu and memory headroom, low
    /// latency and available accelerators; degraded nodes are penalised.
    pub fn score_node(&self, node: &WorkerNode, req: &ResourceRequirements) -> f64 {
        let latency_score = 1.0 / (1.0 + node.resources.latency_ms.max(0.0) / 100.0);
        let mut score = node.performance_score * 0.3
            + (1.0 - node.cpu_usage()) * 0.25
            + node.memory_available_ratio() * 0.2
            + latency_score * 0.15;
        if req.gpu_units > 0 && node.resources.gpu.available() >= req.gpu_units {
            score += 0.1;
        }
        if node.status == HealthStatus::Degraded {
            score *= self.config.degraded_penalty;
        }
        score
    }

    // ------------------------------------------------------------------
    // Health and telemetry
    // ------------------------------------------------------------------

    /// Weighted health score of a node in `0.0..=1.0`.
    pub fn health_score(node: &WorkerNode) -> f64 {
        (1.0 - node.cpu_usage()) * 0.4
            + node.resources.memory.available_ratio() * 0.3
            + node.resources.storage.available_ratio() * 0.3
    }

    /// Recompute every node's health from its usage and evaluate pool alerts.
    /// Returns the nodes whose status changed.
    pub fn health_tick(&mut self) -> Vec<(String, HealthStatus, HealthStatus)> {
        let mut changes = Vec::new();
        for node in self.nodes.values_mut() {
            if self.pinned.contains(&node.id)
                || matches!(node.status, HealthStatus::Offline | HealthStatus::Maintenance)
            {
                continue;
            }
            let score = Self::health_score(node);
            let next = if score < self.config.unhealthy_below {
                HealthStatus::Unhealthy
            } else if score < self.config.degraded_below {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };
            if next != node.status {
                changes.push((node.id.clone(), node.status, next));
                node.status = next;
            }
        }

        if !changes.is_empty() {
            self.recompute_aggregates();
        }
        for (node_id, from, to) in &changes {
            self.announce_status_change(node_id, *from, *to);
        }
        self.evaluate_alerts();
        changes
    }

    /// Apply a status reported by the external health checker. Unschedulable
    /// statuses stick until the checker reports the node healthy again.
    pub fn apply_health_signal(&mut self, node_id: &str, status: HealthStatus) -> Result<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| OrchestratorError::NodeNotFound(node_id.to_string()))?;
        let previous = node.status;
        node.status = status;
        if status.is_schedulable() {
            self.pinned.remove(node_id);
        } else {
            self.pinned.insert(node_id.to_string());
        }
        if previous != status {
            self.recompute_aggregates();
            self.announce_status_change(node_id, previous, status);
        }
        Ok(())
    }

    fn announce_status_change(&self, node_id: &str, from: HealthStatus, to: HealthStatus) {
        if to == HealthStatus::Unhealthy {
            tracing::warn!(node_id, from = %from, "Node became unhealthy");
        } else {
            tracing::info!(node_id, from = %from, to = %to, "Node health changed");
        }
        self.events.nodes().publish(NodeEvent::StatusChanged {
            node_id: node_id.to_string(),
            from,
            to,
        });
        if to == HealthStatus::Unhealthy {
            self.events.nodes().publish(NodeEvent::Unhealthy {
                node_id: node_id.to_string(),
            });
        }
    }

    /// Fold a telemetry sample into the node's latency and rolling score.
    pub fn record_node_telemetry(
        &mut self,
        node_id: &str,
        latency_ms: f64,
        performance_sample: f64,
    ) -> Result<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| OrchestratorError::NodeNotFound(node_id.to_string()))?;
        node.resources.latency_ms = latency_ms.max(0.0);
        node.performance_score = (PERFORMANCE_EMA_ALPHA * performance_sample.clamp(0.0, 1.0)
            + (1.0 - PERFORMANCE_EMA_ALPHA) * node.performance_score)
            .clamp(0.0, 1.0);
        Ok(())
    }

    pub fn utilization(&self) -> Utilization {
        let mut total = ResourceRequirements::default();
        let mut used = ResourceRequirements::default();
        for node in self.nodes.values() {
            let r = &node.resources;
            total = total.saturating_add(&r.total());
            used = used.saturating_add(&ResourceRequirements {
                cpu_millis: r.cpu.used(),
                memory_mb: r.memory.used(),
                storage_mb: r.storage.used(),
                bandwidth_mbps: r.bandwidth.used(),
                gpu_units: r.gpu.used(),
            });
        }
        let ratio = |u: u64, t: u64| if t == 0 { 0.0 } else { u as f64 / t as f64 };
        Utilization {
            cpu: ratio(used.cpu_millis, total.cpu_millis),
            memory: ratio(used.memory_mb, total.memory_mb),
            storage: ratio(used.storage_mb, total.storage_mb),
            bandwidth: ratio(used.bandwidth_mbps, total.bandwidth_mbps),
            gpu: ratio(used.gpu_units, total.gpu_units),
        }
    }

    /// Publish an alert when pool utilization crosses into a new level, and
    /// `Recovered` once it falls back below the warning threshold.
    fn evaluate_alerts(&mut self) {
        let (resource, peak) = self.utilization().peak();
        let level = if peak >= self.config.critical_utilization {
            Some(AlertSeverity::Critical)
        } else if peak >= self.config.warning_utilization {
            Some(AlertSeverity::Warning)
        } else {
            None
        };
        if level == self.alert_level {
            return;
        }
        self.alert_level = level;
        match level {
            Some(severity) => {
                tracing::warn!(resource, utilization = peak, severity = ?severity, "Resource alert");
                self.events.resources().publish(ResourceEvent::Alert(ResourceAlert {
                    severity,
                    resource: resource.to_string(),
                    utilization: peak,
                }));
            }
            None => {
                tracing::info!(resource, utilization = peak, "Resource utilization recovered");
                self.events.resources().publish(ResourceEvent::Recovered);
            }
        }
    }

    // ------------------------------------------------------------------
    // Elastic scaling
    // ------------------------------------------------------------------

    /// Provision `count` nodes with the baseline profile. Returns their ids.
    pub fn scale_up(&mut self, count: usize) -> Vec<String> {
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            let suffix = Uuid::new_v4().simple().to_string();
            let id = format!("elastic-{}", &suffix[..8]);
            let node = WorkerNode::new(id.clone(), id.clone(), &self.config.baseline)
                .with_tag(ELASTIC_TAG);
            if self.register_node(node).is_ok() {
                added.push(id);
            }
        }
        tracing::info!(requested = count, added = added.len(), "Scaled up");
        added
    }

    /// Remove up to `count` idle elastic nodes, newest first. Nodes with
    /// assigned jobs are never removed.
    pub fn scale_down(&mut self, count: usize) -> Vec<String> {
        let mut idle: Vec<(DateTime<Utc>, String)> = self
            .nodes
            .values()
            .filter(|n| n.has_tag(ELASTIC_TAG) && n.assigned_jobs.is_empty())
            .map(|n| (n.registered_at, n.id.clone()))
            .collect();
        idle.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = Vec::new();
        for (_, node_id) in idle.into_iter().take(count) {
            if self.unregister_node(&node_id).is_ok() {
                removed.push(node_id);
            }
        }
        tracing::info!(requested = count, removed = removed.len(), "Scaled down");
        removed
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    fn recompute_aggregates(&mut self) {
        let mut total = ResourceRequirements::default();
        let mut available = ResourceRequirements::default();
        for node in self.nodes.values() {
            total = total.saturating_add(&node.resources.total());
            if node.status.is_schedulable() {
                available = available.saturating_add(&node.resources.available());
            }
        }
        self.total = total;
        self.available = available;
    }

    pub fn summary(&self) -> PoolSummary {
        PoolSummary {
            node_count: self.nodes.len(),
            schedulable_nodes: self
                .nodes
                .values()
                .filter(|n| n.status.is_schedulable())
                .count(),
            total: self.total,
            available: self.available,
            active_allocations: self.allocations.len(),
        }
    }

    /// Every node satisfies `used + available == total`, its usage equals the
    /// sum of its grants, and its job set matches its allocations.
    pub fn check_invariants(&self) -> bool {
        self.nodes.values().all(|node| {
            let grants: Vec<&ResourceAllocation> = self
                .allocations
                .values()
                .filter(|a| a.node_id == node.id)
                .collect();
            let granted = grants
                .iter()
                .fold(ResourceRequirements::default(), |acc, a| {
                    acc.saturating_add(&a.granted)
                });
            let r = &node.resources;
            r.is_consistent()
                && r.cpu.used() == granted.cpu_millis
                && r.memory.used() == granted.memory_mb
                && r.storage.used() == granted.storage_mb
                && r.bandwidth.used() == granted.bandwidth_mbps
                && r.gpu.used() == granted.gpu_units
                && node.assigned_jobs.len() == grants.len()
                && grants.iter().all(|a| node.assigned_jobs.contains(&a.job_id))
        })
    }
}
