use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::{JobAnalysis, JobRequest};
use crate::resources::ResourceRequirements;
use crate::workflow::{StepKind, WorkflowStep};

/// Outcome of a single step attempt that did not succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("no handler registered for step kind '{0}'")]
    NoHandler(StepKind),

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    /// Missing handlers and cancellation end the step immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Failed(_) | StepError::Timeout(_))
    }
}

/// Everything a handler gets to see for one attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub step_id: String,
    pub kind: StepKind,
    pub attempt: u32,
    pub request: Arc<JobRequest>,
    pub analysis: Arc<JobAnalysis>,
    pub resource_hint: Option<ResourceRequirements>,
    /// Results of the steps completed before this one was launched.
    pub results: Arc<HashMap<String, Value>>,
}

impl StepContext {
    pub fn result(&self, step_id: &str) -> Option<&Value> {
        self.results.get(step_id)
    }
}

/// A downstream unit of work (download, transcode, upload, ...).
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError>;
}

/// Routes step attempts to handlers by kind and bounds each attempt by the
/// step's timeout.
#[derive(Clone, Default)]
pub struct StepExecutor {
    handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
    fallback: Option<Arc<dyn StepHandler>>,
}

impl StepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor that sends every step kind to `handler`.
    pub fn uniform(handler: Arc<dyn StepHandler>) -> Self {
        Self::new().with_fallback(handler)
    }

    pub fn with_handler(mut self, kind: StepKind, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Handler for kinds without a dedicated one.
    pub fn with_fallback(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    fn handler(&self, kind: StepKind) -> Option<&Arc<dyn StepHandler>> {
        self.handlers.get(&kind).or(self.fallback.as_ref())
    }

    /// Run one attempt of `step`. Exceeding the timeout is reported as
    /// [`StepError::Timeout`]; cancellation wins over a pending attempt.
    pub async fn execute(
        &self,
        step: &WorkflowStep,
        ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> Result<Value, StepError> {
        let handler = self
            .handler(step.kind)
            .ok_or(StepError::NoHandler(step.kind))?;
        let timeout = step.timeout();

        tracing::debug!(
            job_id = %ctx.job_id,
            step_id = %ctx.step_id,
            attempt = ctx.attempt,
            node_id = %ctx.node_id,
            "Executing step"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            res = tokio::time::timeout(timeout, handler.run(ctx)) => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(StepError::Timeout(timeout)),
            },
        }
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(StepKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("StepExecutor")
            .field("handlers", &kinds)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
