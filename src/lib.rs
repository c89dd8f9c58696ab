pub mod balancer;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod orchestrator;
pub mod resources;
pub mod services;
pub mod shutdown;
pub mod worker;
pub mod workflow;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
