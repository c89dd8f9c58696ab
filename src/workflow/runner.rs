use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, WorkflowEvent};
use crate::job::{JobAnalysis, JobRequest};
use crate::worker::executor::{StepContext, StepError, StepExecutor};
use crate::workflow::template::{WorkflowStep, WorkflowTemplate};

/// Identity of one workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub job_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub request: Arc<JobRequest>,
    pub analysis: Arc<JobAnalysis>,
}

/// Result of a successful run: step outputs keyed by step id.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub execution_id: Uuid,
    pub results: HashMap<String, Value>,
    pub attempts: HashMap<String, u32>,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct StepFailure {
    step_id: String,
    attempts: u32,
    error: StepError,
}

impl StepFailure {
    fn into_error(self) -> OrchestratorError {
        match self.error {
            StepError::Cancelled => OrchestratorError::Cancelled,
            error => OrchestratorError::StepFailed {
                step: self.step_id,
                attempts: self.attempts,
                message: error.to_string(),
            },
        }
    }
}

type StepOutcome = std::result::Result<(Value, u32), StepFailure>;

/// Drives a template's steps against a job.
#[derive(Debug, Clone)]
pub struct WorkflowRunner {
    executor: Arc<StepExecutor>,
    events: EventBus,
}

impl WorkflowRunner {
    pub fn new(executor: Arc<StepExecutor>, events: EventBus) -> Self {
        Self { executor, events }
    }

    /// Execute `template` to completion, failure or cancellation.
    pub async fn execute(
        &self,
        template: &WorkflowTemplate,
        ctx: WorkflowContext,
        cancel: CancellationToken,
    ) -> Result<WorkflowRun> {
        let started = Instant::now();
        tracing::info!(
            job_id = %ctx.job_id,
            execution_id = %ctx.execution_id,
            workflow = %template.name,
            node_id = %ctx.node_id,
            "Workflow started"
        );
        self.events.workflows().publish(WorkflowEvent::Started {
            job_id: ctx.job_id,
            execution_id: ctx.execution_id,
            workflow: template.name.clone(),
        });

        let outcome = if template.parallel {
            self.run_graph(template, &ctx, &cancel).await
        } else {
            self.run_sequential(template, &ctx, &cancel).await
        };

        match outcome {
            Ok((results, attempts)) => {
                tracing::info!(
                    job_id = %ctx.job_id,
                    workflow = %template.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Workflow completed"
                );
                self.events.workflows().publish(WorkflowEvent::Completed {
                    job_id: ctx.job_id,
                    execution_id: ctx.execution_id,
                    workflow: template.name.clone(),
                });
                Ok(WorkflowRun {
                    execution_id: ctx.execution_id,
                    results,
                    attempts,
                    elapsed: started.elapsed(),
                })
            }
            Err(failure) => {
                let error = failure.into_error();
                tracing::warn!(
                    job_id = %ctx.job_id,
                    workflow = %template.name,
                    error = %error,
                    "Workflow failed"
                );
                self.events.workflows().publish(WorkflowEvent::Failed {
                    job_id: ctx.job_id,
                    execution_id: ctx.execution_id,
                    workflow: template.name.clone(),
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn run_sequential(
        &self,
        template: &WorkflowTemplate,
        ctx: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> std::result::Result<(HashMap<String, Value>, HashMap<String, u32>), StepFailure> {
        let mut results = HashMap::new();
        let mut attempts = HashMap::new();
        for step in &template.steps {
            let snapshot = Arc::new(results.clone());
            let (value, used) = run_step(
                self.executor.clone(),
                self.events.clone(),
                step.clone(),
                ctx.clone(),
                snapshot,
                cancel.clone(),
            )
            .await?;
            results.insert(step.id.clone(), value);
            attempts.insert(step.id.clone(), used);
        }
        Ok((results, attempts))
    }

    /// Launch every step whose dependencies are complete, wait for one to
    /// finish, repeat. The first exhausted step cancels its siblings.
    async fn run_graph(
        &self,
        template: &WorkflowTemplate,
        ctx: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> std::result::Result<(HashMap<String, Value>, HashMap<String, u32>), StepFailure> {
        let run_token = cancel.child_token();
        let mut results: HashMap<String, Value> = HashMap::new();
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut pending: Vec<&WorkflowStep> = template.steps.iter().collect();
        let mut in_flight: JoinSet<(String, StepOutcome)> = JoinSet::new();

        loop {
            let (ready, waiting): (Vec<&WorkflowStep>, Vec<&WorkflowStep>) = pending
                .into_iter()
                .partition(|s| s.dependencies.iter().all(|d| completed.contains(d)));
            pending = waiting;

            if !ready.is_empty() {
                let snapshot = Arc::new(results.clone());
                for step in ready {
                    let executor = self.executor.clone();
                    let events = self.events.clone();
                    let step = step.clone();
                    let ctx = ctx.clone();
                    let snapshot = snapshot.clone();
                    let token = run_token.clone();
                    in_flight.spawn(async move {
                        let id = step.id.clone();
                        (id, run_step(executor, events, step, ctx, snapshot, token).await)
                    });
                }
            }

            if in_flight.is_empty() {
                if pending.is_empty() {
                    return Ok((results, attempts));
                }
                // Only reachable for graphs that skipped validation.
                let stuck: Vec<&str> = pending.iter().map(|s| s.id.as_str()).collect();
                return Err(StepFailure {
                    step_id: stuck.join(","),
                    attempts: 0,
                    error: StepError::failed("dependencies can never be satisfied"),
                });
            }

            let failure = match in_flight.join_next().await {
                Some(Ok((id, Ok((value, used))))) => {
                    completed.insert(id.clone());
                    results.insert(id.clone(), value);
                    attempts.insert(id, used);
                    continue;
                }
                Some(Ok((_, Err(failure)))) => failure,
                Some(Err(join_err)) => StepFailure {
                    step_id: "unknown".into(),
                    attempts: 0,
                    error: StepError::failed(format!("step task aborted: {join_err}")),
                },
                None => continue,
            };

            run_token.cancel();
            while in_flight.join_next().await.is_some() {}
            return Err(failure);
        }
    }
}

/// Attempt a step up to its policy's limit, sleeping the backoff delay
/// between attempts.
async fn run_step(
    executor: Arc<StepExecutor>,
    events: EventBus,
    step: WorkflowStep,
    ctx: WorkflowContext,
    results: Arc<HashMap<String, Value>>,
    cancel: CancellationToken,
) -> StepOutcome {
    let max_attempts = step.retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(StepFailure {
                step_id: step.id.clone(),
                attempts: attempt - 1,
                error: StepError::Cancelled,
            });
        }

        let step_ctx = StepContext {
            job_id: ctx.job_id,
            execution_id: ctx.execution_id,
            node_id: ctx.node_id.clone(),
            step_id: step.id.clone(),
            kind: step.kind,
            attempt,
            request: ctx.request.clone(),
            analysis: ctx.analysis.clone(),
            resource_hint: step.resource_hint,
            results: results.clone(),
        };

        let error = match executor.execute(&step, &step_ctx, &cancel).await {
            Ok(value) => {
                tracing::debug!(job_id = %ctx.job_id, step_id = %step.id, attempt, "Step completed");
                events.workflows().publish(WorkflowEvent::StepCompleted {
                    job_id: ctx.job_id,
                    execution_id: ctx.execution_id,
                    step_id: step.id.clone(),
                    attempts: attempt,
                });
                return Ok((value, attempt));
            }
            Err(e) => e,
        };

        if error == StepError::Cancelled {
            return Err(StepFailure {
                step_id: step.id.clone(),
                attempts: attempt,
                error,
            });
        }

        let will_retry = error.is_retryable() && attempt < max_attempts;
        tracing::warn!(
            job_id = %ctx.job_id,
            step_id = %step.id,
            attempt,
            max_attempts,
            will_retry,
            error = %error,
            "Step attempt failed"
        );
        events.workflows().publish(WorkflowEvent::StepFailed {
            job_id: ctx.job_id,
            execution_id: ctx.execution_id,
            step_id: step.id.clone(),
            attempt,
            error: error.to_string(),
            will_retry,
        });

        if !will_retry {
            return Err(StepFailure {
                step_id: step.id.clone(),
                attempts: attempt,
                error,
            });
        }

        let delay = step.retry.delay_for(attempt);
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(StepFailure {
                    step_id: step.id.clone(),
                    attempts: attempt,
                    error: StepError::Cancelled,
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
