use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{BalancerConfig, BalancingStrategy, FactorWeights};
use crate::resources::{HealthStatus, ResourceRequirements, WorkerNode};

/// Picks one node out of a candidate set according to the configured strategy.
///
/// Every selection counts as an in-flight connection on the chosen node until
/// the caller hands it back with [`NodeSelector::release_connection`].
#[derive(Debug)]
pub struct NodeSelector {
    config: BalancerConfig,
    round_robin_index: usize,
    connections: HashMap<String, usize>,
    rng: StdRng,
}

impl NodeSelector {
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            round_robin_index: 0,
            connections: HashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic random source for weighted selection.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn strategy(&self) -> BalancingStrategy {
        self.config.strategy
    }

    pub fn set_strategy(&mut self, strategy: BalancingStrategy) {
        self.config.strategy = strategy;
    }

    pub fn connections(&self, node_id: &str) -> usize {
        self.connections.get(node_id).copied().unwrap_or(0)
    }

    /// Count a placement the caller made without going through selection.
    pub fn record_connection(&mut self, node_id: &str) {
        *self.connections.entry(node_id.to_string()).or_insert(0) += 1;
    }

    pub fn release_connection(&mut self, node_id: &str) {
        if let Some(count) = self.connections.get_mut(node_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.connections.remove(node_id);
            }
        }
    }

    /// Select a node id. Only healthy and degraded candidates are considered;
    /// returns `None` when none remain or the strategy rejects all of them.
    pub fn select_node(
        &mut self,
        candidates: &[WorkerNode],
        requirements: Option<&ResourceRequirements>,
        hash_key: Option<&str>,
    ) -> Option<String> {
        let eligible: Vec<&WorkerNode> = candidates
            .iter()
            .filter(|n| n.status.is_schedulable())
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let chosen = match self.config.strategy {
            BalancingStrategy::RoundRobin => self.round_robin(&eligible),
            BalancingStrategy::LeastConnections => self.least_connections(&eligible),
            BalancingStrategy::WeightedRoundRobin => self.weighted(&eligible),
            BalancingStrategy::HashBased => match hash_key {
                Some(key) => Self::hashed(&eligible, key),
                None => self.round_robin(&eligible),
            },
            BalancingStrategy::ResourceFit => Self::best_by(&eligible, |n| {
                Self::resource_fit_score(n, requirements)
            }),
            BalancingStrategy::MultiFactor => {
                let weights = self.config.weights.clone();
                Self::best_by(&eligible, |n| {
                    self.multi_factor_score(n, requirements, &weights)
                })
            }
        }?;

        let node_id = chosen.id.clone();
        *self.connections.entry(node_id.clone()).or_insert(0) += 1;
        tracing::debug!(
            node_id = %node_id,
            strategy = %self.config.strategy,
            candidates = eligible.len(),
            "Node selected"
        );
        Some(node_id)
    }

    fn round_robin<'a>(&mut self, nodes: &[&'a WorkerNode]) -> Option<&'a WorkerNode> {
        let node = nodes[self.round_robin_index % nodes.len()];
        self.round_robin_index = self.round_robin_index.wrapping_add(1);
        Some(node)
    }

    fn least_connections<'a>(&self, nodes: &[&'a WorkerNode]) -> Option<&'a WorkerNode> {
        nodes
            .iter()
            .copied()
            .min_by_key(|n| self.connections(&n.id))
    }

    /// Draw proportionally to performance score.
    fn weighted<'a>(&mut self, nodes: &[&'a WorkerNode]) -> Option<&'a WorkerNode> {
        let mut cumulative = Vec::with_capacity(nodes.len());
        let mut total = 0.0;
        for node in nodes {
            total += node.performance_score.max(0.0);
            cumulative.push(total);
        }
        if total <= 0.0 {
            let idx = self.rng.gen_range(0..nodes.len());
            return Some(nodes[idx]);
        }
        let draw = self.rng.gen_range(0.0..total);
        cumulative
            .iter()
            .position(|&c| draw < c)
            .map(|idx| nodes[idx])
            .or_else(|| nodes.last().copied())
    }

    fn hashed<'a>(nodes: &[&'a WorkerNode], key: &str) -> Option<&'a WorkerNode> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % nodes.len() as u64) as usize;
        Some(nodes[idx])
    }

    /// Highest strictly-positive score wins; ties keep the earliest candidate.
    fn best_by<'a, F>(nodes: &[&'a WorkerNode], mut score: F) -> Option<&'a WorkerNode>
    where
        F: FnMut(&WorkerNode) -> f64,
    {
        let mut best: Option<(&'a WorkerNode, f64)> = None;
        for &node in nodes {
            let s = score(node);
            if s <= 0.0 {
                continue;
            }
            if best.map_or(true, |(_, b)| s > b) {
                best = Some((node, s));
            }
        }
        best.map(|(n, _)| n)
    }

    /// Mean leftover headroom across dimensions after placing the job.
    /// Zero when any dimension (accelerators included) is insufficient.
    pub fn resource_fit_score(node: &WorkerNode, requirements: Option<&ResourceRequirements>) -> f64 {
        let req = requirements.copied().unwrap_or_default();
        let r = &node.resources;
        if !r.can_fit(&req) {
            return 0.0;
        }
        let dims = [
            (r.cpu.available(), r.cpu.total(), req.cpu_millis),
            (r.memory.available(), r.memory.total(), req.memory_mb),
            (r.storage.available(), r.storage.total(), req.storage_mb),
            (r.bandwidth.available(), r.bandwidth.total(), req.bandwidth_mbps),
        ];
        let headroom: f64 = dims
            .iter()
            .map(|&(avail, total, need)| {
                if total == 0 {
                    0.0
                } else {
                    (avail - need) as f64 / total as f64
                }
            })
            .sum::<f64>()
            / dims.len() as f64;
        // A node that fits exactly still qualifies.
        headroom.max(f64::EPSILON)
    }

    fn multi_factor_score(
        &self,
        node: &WorkerNode,
        requirements: Option<&ResourceRequirements>,
        w: &FactorWeights,
    ) -> f64 {
        let latency = 1.0 / (1.0 + node.resources.latency_ms.max(0.0) / 100.0);
        let queue_depth = node.job_count() + self.connections(&node.id);
        let queue = 1.0 / (1.0 + queue_depth as f64);
        let fits = requirements.map_or(true, |req| node.resources.can_fit(req));

        let mut score = w.performance * node.performance_score
            + w.cpu_headroom * (1.0 - node.cpu_usage())
            + w.memory_headroom * node.memory_available_ratio()
            + w.latency * latency
            + w.queue_depth * queue
            + if fits { w.resource_fit } else { 0.0 };
        if node.status == HealthStatus::Degraded {
            score *= w.degraded_penalty;
        }
        score
    }
}
