use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::analyzer::JobAnalysis;
use crate::job::request::JobRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Allowed lifecycle edges. A run may finish before the launcher marks the
    /// job processing, so pending jobs can complete directly.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Processing | Retrying | Completed | Failed | Cancelled) => true,
            (Processing, Retrying | Completed | Failed | Cancelled) => true,
            (Retrying, Processing | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Processing => write!(f, "processing"),
            JobState::Retrying => write!(f, "retrying"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub state: JobState,
    pub request: Arc<JobRequest>,
    pub analysis: JobAnalysis,
    pub workflow: String,
    pub node_id: Option<String>,
    /// Identifies the workflow run currently allowed to report on this job.
    pub execution_id: Option<Uuid>,
    pub retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(request: JobRequest, analysis: JobAnalysis, workflow: String) -> Self {
        Self::with_id(Uuid::new_v4(), request, analysis, workflow)
    }

    pub fn with_id(id: Uuid, request: JobRequest, analysis: JobAnalysis, workflow: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: JobState::Pending,
            request: Arc::new(request),
            analysis,
            workflow,
            node_id: None,
            execution_id: None,
            retries: 0,
            error: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `next` if the edge is allowed. Returns whether the state changed.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::debug!(
                job_id = %self.id,
                from = %self.state,
                to = %next,
                "Ignoring invalid job transition"
            );
            return false;
        }
        let now = Utc::now();
        self.state = next;
        self.updated_at = now;
        if next == JobState::Processing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            self.execution_id = None;
        }
        true
    }

    /// Record a terminal failure together with its reason.
    pub fn fail(&mut self, state: JobState, error: impl Into<String>) -> bool {
        if self.transition(state) {
            self.error = Some(error.into());
            true
        } else {
            false
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Point-in-time view of a job returned by status queries and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub state: JobState,
    pub workflow: String,
    pub node_id: Option<String>,
    pub retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            state: job.state,
            workflow: job.workflow.clone(),
            node_id: job.node_id.clone(),
            retries: job.retries,
            error: job.error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
