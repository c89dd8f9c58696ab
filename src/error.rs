use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid job request: {0}")]
    Validation(String),

    #[error("Insufficient resources: {0}")]
    ResourceExhausted(String),

    #[error("No node available: {0}")]
    NoNodeAvailable(String),

    #[error("Step '{step}' failed after {attempts} attempt(s): {message}")]
    StepFailed {
        step: String,
        attempts: u32,
        message: String,
    },

    #[error("Workflow '{workflow}' failed: {message}")]
    WorkflowFailed { workflow: String, message: String },

    #[error("Node lost: {0}")]
    NodeLost(String),

    #[error("Could not acquire lock {0}")]
    LockUnavailable(String),

    #[error("Not accepting new jobs: {0}")]
    AdmissionClosed(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already registered: {0}")]
    DuplicateNode(String),

    #[error("Job {0} already holds a resource allocation")]
    AlreadyAllocated(Uuid),

    #[error("Unknown workflow template: {0}")]
    UnknownWorkflow(String),

    #[error("Invalid workflow template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Whether the caller (or the orchestrator itself) may try the same work again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ResourceExhausted(_)
                | OrchestratorError::NoNodeAvailable(_)
                | OrchestratorError::StepFailed { .. }
                | OrchestratorError::WorkflowFailed { .. }
                | OrchestratorError::NodeLost(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
