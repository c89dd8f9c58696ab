//! Contracts with the collaborators around the orchestrator, plus the
//! in-process implementations the binary and tests use.
//!
//! - [`CoordinationService`]: named locks and state snapshots.
//! - [`AnalyticsProvider`]: system metrics and scaling recommendations.

pub mod analytics;
pub mod coordination;

pub use analytics::{
    AnalyticsProvider, ScalingAction, ScalingPrediction, StaticAnalytics, SystemMetrics,
    UtilizationAnalytics,
};
pub use coordination::{CoordinationService, DistributedLock, InMemoryCoordinator, StateSnapshot};
