//! Compute inventory and resource accounting.
//!
//! - [`WorkerNode`] / [`NodeResources`]: per-node capacity, usage and health
//! - [`ResourcePool`]: registration, scored allocation, release, health
//!   derivation, alerting and elastic scaling

pub mod node;
pub mod pool;

pub use node::{HealthStatus, NodeResources, ResourceCounter, ResourceRequirements, WorkerNode};
pub use pool::{PoolSummary, ResourceAllocation, ResourcePool, Utilization, ELASTIC_TAG};
