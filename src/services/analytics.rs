use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::job::JobStore;
use crate::resources::{ResourcePool, Utilization, ELASTIC_TAG};

/// Aggregate counts and resource percentages at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub active_jobs: usize,
    pub tracked_jobs: usize,
    pub node_count: usize,
    pub schedulable_nodes: usize,
    pub utilization: Utilization,
    pub collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingPrediction {
    pub action: ScalingAction,
    pub node_count: usize,
    pub confidence: f64,
}

impl ScalingPrediction {
    pub fn maintain() -> Self {
        Self {
            action: ScalingAction::Maintain,
            node_count: 0,
            confidence: 1.0,
        }
    }
}

/// Source of metrics and scaling advice. The orchestrator acts on what it
/// returns without re-deriving it.
#[async_trait]
pub trait AnalyticsProvider: Send + Sync {
    async fn metrics(&self) -> SystemMetrics;
    async fn predictions(&self) -> ScalingPrediction;
}

/// Derives metrics from the live pool and job table, and recommends
/// scaling from the busiest resource dimension.
pub struct UtilizationAnalytics {
    pool: Arc<RwLock<ResourcePool>>,
    jobs: Arc<RwLock<JobStore>>,
    scale_up_above: f64,
    scale_down_below: f64,
}

impl UtilizationAnalytics {
    pub fn new(pool: Arc<RwLock<ResourcePool>>, jobs: Arc<RwLock<JobStore>>) -> Self {
        Self {
            pool,
            jobs,
            scale_up_above: 0.8,
            scale_down_below: 0.2,
        }
    }

    pub fn with_thresholds(mut self, scale_up_above: f64, scale_down_below: f64) -> Self {
        self.scale_up_above = scale_up_above;
        self.scale_down_below = scale_down_below;
        self
    }
}

#[async_trait]
impl AnalyticsProvider for UtilizationAnalytics {
    async fn metrics(&self) -> SystemMetrics {
        let (active_jobs, tracked_jobs) = {
            let jobs = self.jobs.read().await;
            (jobs.active_count(), jobs.len())
        };
        let pool = self.pool.read().await;
        let summary = pool.summary();
        SystemMetrics {
            active_jobs,
            tracked_jobs,
            node_count: summary.node_count,
            schedulable_nodes: summary.schedulable_nodes,
            utilization: pool.utilization(),
            collected_at: Some(Utc::now()),
        }
    }

    async fn predictions(&self) -> ScalingPrediction {
        let pool = self.pool.read().await;
        let (_, peak) = pool.utilization().peak();
        let nodes = pool.node_count();

        if nodes == 0 || peak >= self.scale_up_above {
            // Grow by a quarter of the fleet, at least one node.
            return ScalingPrediction {
                action: ScalingAction::ScaleUp,
                node_count: (nodes / 4).max(1),
                confidence: if nodes == 0 { 1.0 } else { peak.min(1.0) },
            };
        }

        let idle_elastic = pool
            .nodes()
            .filter(|n| n.has_tag(ELASTIC_TAG) && n.job_count() == 0)
            .count();
        if peak < self.scale_down_below && idle_elastic > 0 {
            return ScalingPrediction {
                action: ScalingAction::ScaleDown,
                node_count: 1,
                confidence: 1.0 - peak,
            };
        }
        ScalingPrediction::maintain()
    }
}

/// Analytics with fixed answers that callers can change at runtime.
#[derive(Debug)]
pub struct StaticAnalytics {
    metrics: Mutex<SystemMetrics>,
    prediction: Mutex<ScalingPrediction>,
}

impl Default for StaticAnalytics {
    fn default() -> Self {
        Self {
            metrics: Mutex::new(SystemMetrics::default()),
            prediction: Mutex::new(ScalingPrediction::maintain()),
        }
    }
}

impl StaticAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_prediction(&self, prediction: ScalingPrediction) {
        *self.prediction.lock().await = prediction;
    }

    pub async fn set_metrics(&self, metrics: SystemMetrics) {
        *self.metrics.lock().await = metrics;
    }
}

#[async_trait]
impl AnalyticsProvider for StaticAnalytics {
    async fn metrics(&self) -> SystemMetrics {
        self.metrics.lock().await.clone()
    }

    async fn predictions(&self) -> ScalingPrediction {
        *self.prediction.lock().await
    }
}
