//! Step execution on worker nodes.
//!
//! - [`StepExecutor`] routes each step attempt to the [`StepHandler`]
//!   registered for its kind and bounds it by the step timeout.
//! - [`ResourceMonitor`] is the periodic health task feeding the pool.
//! - [`SimulatedStepHandler`] stands in for the media pipeline in the CLI.

pub mod executor;
pub mod monitor;
pub mod simulated;

pub use executor::{StepContext, StepError, StepExecutor, StepHandler};
pub use monitor::ResourceMonitor;
pub use simulated::SimulatedStepHandler;
