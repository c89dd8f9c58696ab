pub mod analyzer;
pub mod lifecycle;
pub mod request;
pub mod store;

pub use analyzer::{Complexity, JobAnalysis, JobAnalyzer, WorkflowKind};
pub use lifecycle::{Job, JobState, JobSummary};
pub use request::{ElementKind, JobRequest, MediaElement, OutputFormat};
pub use store::JobStore;
