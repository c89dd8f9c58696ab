//! Workflow templates and their execution.
//!
//! - [`WorkflowCatalog`] holds the named templates and picks one for a job
//!   analysis, falling back to `balanced-async`.
//! - [`WorkflowRunner`] executes a template. Sequential templates run in
//!   declaration order; parallel ones launch every step whose dependencies
//!   have completed. Each attempt is bounded by the step timeout and retried
//!   per its [`RetryPolicy`].

pub mod catalog;
pub mod runner;
pub mod template;

pub use catalog::{builtin_templates, WorkflowCatalog, FALLBACK_WORKFLOW};
pub use runner::{WorkflowContext, WorkflowRun, WorkflowRunner};
pub use template::{Backoff, RetryPolicy, StepKind, WorkflowStep, WorkflowTemplate};
