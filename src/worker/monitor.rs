use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::resources::ResourcePool;

/// Periodically re-derives node health and pool alerts from usage.
pub struct ResourceMonitor {
    pool: Arc<RwLock<ResourcePool>>,
    interval: Duration,
}

impl ResourceMonitor {
    pub fn new(pool: Arc<RwLock<ResourcePool>>, interval_ms: u64) -> Self {
        Self {
            pool,
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Resource monitor stopped");
                    break;
                }
                _ = interval.tick() => {
                    let changes = self.pool.write().await.health_tick();
                    if !changes.is_empty() {
                        tracing::debug!(changed = changes.len(), "Node health updated");
                    }
                }
            }
        }
    }
}
