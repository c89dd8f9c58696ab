//! The orchestration core.
//!
//! [`Orchestrator`] owns the job table, the resource pool and the node
//! selector. It admits jobs, launches their workflow runs under a
//! [`ResiliencePolicy`], and reacts to run outcomes, node loss and resource
//! alerts from a single event loop. Periodic maintenance covers predictive
//! scaling, load rebalancing ([`plan`]), purging and state snapshots.

pub mod engine;
pub mod rebalance;
pub mod resilience;

pub use engine::{MaintenanceReport, Orchestrator, OrchestratorBuilder};
pub use rebalance::{plan, Migration, RebalancePlan};
pub use resilience::{CircuitBreaker, CircuitState, ResiliencePolicy};
