use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Node selection strategy used by the [`NodeSelector`](crate::balancer::NodeSelector).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancingStrategy {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    HashBased,
    ResourceFit,
    #[default]
    MultiFactor,
}

impl fmt::Display for BalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalancingStrategy::RoundRobin => write!(f, "round-robin"),
            BalancingStrategy::LeastConnections => write!(f, "least-connections"),
            BalancingStrategy::WeightedRoundRobin => write!(f, "weighted-round-robin"),
            BalancingStrategy::HashBased => write!(f, "hash-based"),
            BalancingStrategy::ResourceFit => write!(f, "resource-fit"),
            BalancingStrategy::MultiFactor => write!(f, "multi-factor"),
        }
    }
}

impl FromStr for BalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(BalancingStrategy::RoundRobin),
            "least-connections" => Ok(BalancingStrategy::LeastConnections),
            "weighted-round-robin" | "weighted" => Ok(BalancingStrategy::WeightedRoundRobin),
            "hash-based" | "hash" => Ok(BalancingStrategy::HashBased),
            "resource-fit" => Ok(BalancingStrategy::ResourceFit),
            "multi-factor" | "ai-driven" => Ok(BalancingStrategy::MultiFactor),
            other => Err(format!("unknown balancing strategy: {}", other)),
        }
    }
}

/// Resource profile for nodes provisioned by `scale_up` and by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeProfile {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    pub storage_mb: u64,
    pub bandwidth_mbps: u64,
    pub gpu_units: u64,
    pub latency_ms: f64,
}

impl Default for NodeProfile {
    fn default() -> Self {
        Self {
            cpu_millis: 8_000,
            memory_mb: 16_384,
            storage_mb: 102_400,
            bandwidth_mbps: 1_000,
            gpu_units: 1,
            latency_ms: 10.0,
        }
    }
}

/// Health derivation, alerting and scoring knobs for the resource pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePoolConfig {
    /// Profile used for elastically provisioned nodes.
    pub baseline: NodeProfile,
    /// Health score below which a node is degraded.
    pub degraded_below: f64,
    /// Health score below which a node is unhealthy.
    pub unhealthy_below: f64,
    /// Pool utilization (0..1) that raises a warning alert.
    pub warning_utilization: f64,
    /// Pool utilization (0..1) that raises a critical alert.
    pub critical_utilization: f64,
    /// Multiplier applied to the allocation score of degraded nodes.
    pub degraded_penalty: f64,
    /// Interval of the health/alert monitoring tick.
    pub monitor_interval_ms: u64,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            baseline: NodeProfile::default(),
            degraded_below: 0.5,
            unhealthy_below: 0.2,
            warning_utilization: 0.75,
            critical_utilization: 0.9,
            degraded_penalty: 0.5,
            monitor_interval_ms: 1_000,
        }
    }
}

/// Weights of the multi-factor node score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    pub performance: f64,
    pub cpu_headroom: f64,
    pub memory_headroom: f64,
    pub latency: f64,
    pub queue_depth: f64,
    pub resource_fit: f64,
    /// Multiplier applied to degraded nodes.
    pub degraded_penalty: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            performance: 0.3,
            cpu_headroom: 0.2,
            memory_headroom: 0.15,
            latency: 0.1,
            queue_depth: 0.15,
            resource_fit: 0.1,
            degraded_penalty: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: BalancingStrategy,
    pub weights: FactorWeights,
}

/// Workflow-level retry and circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Workflow runs attempted on the same node before the job is reported failed.
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Consecutive failed runs that open the breaker.
    pub breaker_failure_threshold: u32,
    pub breaker_reset_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_delay_ms: 500,
            breaker_failure_threshold: 5,
            breaker_reset_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Ceiling on non-terminal jobs. A critical resource alert sets the live ceiling to zero.
    pub max_concurrent_jobs: usize,
    /// Orchestrator-level retries (new node, fresh workflow run) per job.
    pub max_job_retries: u32,
    pub auto_recovery: bool,
    pub predictive_scaling: bool,
    /// Minimum prediction confidence acted upon.
    pub scaling_confidence: f64,
    pub tick_interval_ms: u64,
    /// How long terminal jobs stay queryable.
    pub job_retention_secs: u64,
    pub lock_ttl_ms: u64,
    pub drain_timeout_ms: u64,
    /// A node is overloaded above `overload_factor` × mean job count.
    pub overload_factor: f64,
    /// A node is underloaded below `underload_factor` × mean job count.
    pub underload_factor: f64,
    pub resilience: ResilienceConfig,
    pub pool: ResourcePoolConfig,
    pub balancer: BalancerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 100,
            max_job_retries: 3,
            auto_recovery: true,
            predictive_scaling: false,
            scaling_confidence: 0.7,
            tick_interval_ms: 5_000,
            job_retention_secs: 300,
            lock_ttl_ms: 600_000,
            drain_timeout_ms: 30_000,
            overload_factor: 1.5,
            underload_factor: 0.5,
            resilience: ResilienceConfig::default(),
            pool: ResourcePoolConfig::default(),
            balancer: BalancerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load a JSON config file. Fields missing from the file keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: OrchestratorConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_strategy(mut self, strategy: BalancingStrategy) -> Self {
        self.balancer.strategy = strategy;
        self
    }

    pub fn with_max_job_retries(mut self, retries: u32) -> Self {
        self.max_job_retries = retries;
        self
    }

    pub fn with_tick_interval(mut self, interval_ms: u64) -> Self {
        self.tick_interval_ms = interval_ms;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 || self.pool.monitor_interval_ms == 0 {
            return Err(OrchestratorError::Config(
                "tick intervals must be greater than zero".to_string(),
            ));
        }
        if self.resilience.max_attempts == 0 {
            return Err(OrchestratorError::Config(
                "resilience.max_attempts must be at least 1".to_string(),
            ));
        }
        let pool = &self.pool;
        if !(0.0..=1.0).contains(&pool.unhealthy_below)
            || !(0.0..=1.0).contains(&pool.degraded_below)
            || pool.unhealthy_below > pool.degraded_below
        {
            return Err(OrchestratorError::Config(
                "health thresholds must satisfy 0 <= unhealthy_below <= degraded_below <= 1"
                    .to_string(),
            ));
        }
        if pool.warning_utilization > pool.critical_utilization {
            return Err(OrchestratorError::Config(
                "warning_utilization must not exceed critical_utilization".to_string(),
            ));
        }
        if self.underload_factor >= self.overload_factor {
            return Err(OrchestratorError::Config(
                "underload_factor must be below overload_factor".to_string(),
            ));
        }
        let w = &self.balancer.weights;
        let total = w.performance
            + w.cpu_headroom
            + w.memory_headroom
            + w.latency
            + w.queue_depth
            + w.resource_fit;
        if total <= 0.0 {
            return Err(OrchestratorError::Config(
                "balancer weights must not all be zero".to_string(),
            ));
        }
        Ok(())
    }
}
