use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::balancer::NodeSelector;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{AlertSeverity, EventBus, JobEvent, NodeEvent, ResourceEvent};
use crate::job::{Job, JobAnalyzer, JobRequest, JobState, JobStore, JobSummary};
use crate::orchestrator::rebalance;
use crate::orchestrator::resilience::{CircuitBreaker, ResiliencePolicy};
use crate::resources::{HealthStatus, ResourcePool, ResourceRequirements, WorkerNode};
use crate::services::{
    AnalyticsProvider, CoordinationService, InMemoryCoordinator, ScalingAction, StateSnapshot,
    UtilizationAnalytics,
};
use crate::worker::{ResourceMonitor, StepExecutor};
use crate::workflow::{WorkflowCatalog, WorkflowContext, WorkflowRunner};

const DRAIN_POLL: Duration = Duration::from_millis(50);

fn lock_key(job_id: Uuid) -> String {
    format!("job:{job_id}")
}

/// A claimed admission slot for a submission still being placed.
struct AdmissionSlot<'a>(&'a AtomicUsize);

impl Drop for AdmissionSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Report from a workflow run task back to the event loop.
#[derive(Debug)]
enum RunOutcome {
    Completed {
        job_id: Uuid,
        execution_id: Uuid,
    },
    Failed {
        job_id: Uuid,
        execution_id: Uuid,
        error: String,
    },
}

impl RunOutcome {
    fn ids(&self) -> (Uuid, Uuid) {
        match self {
            RunOutcome::Completed {
                job_id,
                execution_id,
            }
            | RunOutcome::Failed {
                job_id,
                execution_id,
                ..
            } => (*job_id, *execution_id),
        }
    }
}

struct Execution {
    execution_id: Uuid,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Any healthy or degraded node.
    Schedulable,
    /// Healthy nodes only.
    HealthyOnly,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub scaled_up: usize,
    pub scaled_down: usize,
    pub migrated: usize,
    pub purged: usize,
    pub snapshot_saved: bool,
}

/// Wires the orchestrator's collaborators together.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    events: EventBus,
    catalog: WorkflowCatalog,
    executor: Option<StepExecutor>,
    coordinator: Option<Arc<dyn CoordinationService>>,
    analytics: Option<Arc<dyn AnalyticsProvider>>,
    selector_seed: Option<u64>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            events: EventBus::new(),
            catalog: WorkflowCatalog::builtin(),
            executor: None,
            coordinator: None,
            analytics: None,
            selector_seed: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_catalog(mut self, catalog: WorkflowCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_executor(mut self, executor: StepExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_coordinator(mut self, coordinator: Arc<dyn CoordinationService>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsProvider>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn with_selector_seed(mut self, seed: u64) -> Self {
        self.selector_seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        let executor = self.executor.ok_or_else(|| {
            OrchestratorError::Config("a step executor is required".to_string())
        })?;
        if self.catalog.is_empty() {
            return Err(OrchestratorError::Config(
                "workflow catalog is empty".to_string(),
            ));
        }

        let pool = Arc::new(RwLock::new(ResourcePool::new(
            self.config.pool.clone(),
            self.events.clone(),
        )));
        let jobs = Arc::new(RwLock::new(JobStore::new()));
        let mut selector = NodeSelector::new(self.config.balancer.clone());
        if let Some(seed) = self.selector_seed {
            selector = selector.with_seed(seed);
        }
        let breaker = Arc::new(CircuitBreaker::new(
            "workflow-runs",
            self.config.resilience.breaker_failure_threshold,
            Duration::from_millis(self.config.resilience.breaker_reset_ms),
            self.events.clone(),
        ));
        let analytics: Arc<dyn AnalyticsProvider> = match self.analytics {
            Some(analytics) => analytics,
            None => Arc::new(UtilizationAnalytics::new(pool.clone(), jobs.clone())),
        };
        let coordinator: Arc<dyn CoordinationService> = match self.coordinator {
            Some(coordinator) => coordinator,
            None => Arc::new(InMemoryCoordinator::new()),
        };
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                owner: format!("orchestrator-{}", Uuid::new_v4().simple()),
                admission_limit: AtomicUsize::new(self.config.max_concurrent_jobs),
                admitting: AtomicUsize::new(0),
                resilience: ResiliencePolicy::new(&self.config.resilience, breaker),
                runner: WorkflowRunner::new(Arc::new(executor), self.events.clone()),
                config: self.config,
                events: self.events,
                analyzer: JobAnalyzer::new(),
                catalog: self.catalog,
                pool,
                selector: Mutex::new(selector),
                jobs,
                executions: StdMutex::new(HashMap::new()),
                coordinator,
                analytics,
                draining: AtomicBool::new(false),
                outcome_tx,
                outcome_rx: StdMutex::new(Some(outcome_rx)),
                stop: CancellationToken::new(),
                tasks: StdMutex::new(Vec::new()),
            }),
        })
    }
}

struct Inner {
    config: OrchestratorConfig,
    /// Lock owner identity of this instance.
    owner: String,
    events: EventBus,
    analyzer: JobAnalyzer,
    catalog: WorkflowCatalog,
    runner: WorkflowRunner,
    resilience: ResiliencePolicy,
    pool: Arc<RwLock<ResourcePool>>,
    selector: Mutex<NodeSelector>,
    jobs: Arc<RwLock<JobStore>>,
    executions: StdMutex<HashMap<Uuid, Execution>>,
    coordinator: Arc<dyn CoordinationService>,
    analytics: Arc<dyn AnalyticsProvider>,
    admission_limit: AtomicUsize,
    /// Submissions past the admission check but not yet in the job table.
    admitting: AtomicUsize,
    draining: AtomicBool,
    outcome_tx: mpsc::UnboundedSender<RunOutcome>,
    outcome_rx: StdMutex<Option<mpsc::UnboundedReceiver<RunOutcome>>>,
    stop: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Accepts jobs, places them and drives their lifecycle.
///
/// Lock order: jobs, then pool, then selector. The executions table is a
/// plain mutex never held across an await.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.inner.catalog
    }

    pub fn pool(&self) -> Arc<RwLock<ResourcePool>> {
        self.inner.pool.clone()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.inner.resilience.breaker()
    }

    /// Current ceiling on active jobs; zero while admission is halted.
    pub fn admission_limit(&self) -> usize {
        self.inner.admission_limit.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Inventory passthroughs
    // ------------------------------------------------------------------

    pub async fn register_node(&self, node: WorkerNode) -> Result<()> {
        self.inner.pool.write().await.register_node(node)
    }

    /// Remove a node. Its jobs are reassigned by the event loop.
    pub async fn unregister_node(&self, node_id: &str) -> Result<Vec<Uuid>> {
        self.inner.pool.write().await.unregister_node(node_id)
    }

    pub async fn apply_health_signal(&self, node_id: &str, status: HealthStatus) -> Result<()> {
        self.inner
            .pool
            .write()
            .await
            .apply_health_signal(node_id, status)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn job_state(&self, job_id: Uuid) -> Option<JobState> {
        self.inner.jobs.read().await.state(&job_id)
    }

    pub async fn job(&self, job_id: Uuid) -> Option<JobSummary> {
        self.inner.jobs.read().await.get(&job_id).map(JobSummary::from)
    }

    pub async fn jobs(&self) -> Vec<JobSummary> {
        self.inner.jobs.read().await.summaries()
    }

    pub async fn active_jobs(&self) -> usize {
        self.inner.jobs.read().await.active_count()
    }

    // ------------------------------------------------------------------
    // Submission and cancellation
    // ------------------------------------------------------------------

    /// Accept a job: analyze, pick a workflow, take the job lock, allocate,
    /// select a node and launch the run. Every rejection is synchronous.
    ///
    /// The job table is locked only to claim an admission slot and to insert
    /// the placed job; coordination and placement run outside it.
    pub async fn submit(&self, request: JobRequest) -> Result<Uuid> {
        if self.is_draining() {
            return Err(OrchestratorError::AdmissionClosed(
                "orchestrator is shutting down".to_string(),
            ));
        }
        request.validate()?;
        let analysis = self.inner.analyzer.analyze(&request);
        let template = self.inner.catalog.select_workflow(&analysis)?;

        let _slot = {
            let jobs = self.inner.jobs.read().await;
            let limit = self.admission_limit();
            let admitting = self.inner.admitting.fetch_add(1, Ordering::SeqCst);
            let slot = AdmissionSlot(&self.inner.admitting);
            let active = jobs.active_count() + admitting;
            if active >= limit {
                let reason = if limit == 0 {
                    "admission halted by a critical resource alert".to_string()
                } else {
                    format!("{active} active jobs, limit is {limit}")
                };
                return Err(OrchestratorError::AdmissionClosed(reason));
            }
            slot
        };

        let job_id = Uuid::new_v4();
        let key = lock_key(job_id);
        let lock = self
            .inner
            .coordinator
            .acquire_lock(&key, &self.inner.owner, self.inner.config.lock_ttl())
            .await;
        if lock.is_none() {
            return Err(OrchestratorError::LockUnavailable(key));
        }

        let node_id = match self
            .place_new(job_id, &analysis.requirements, request.client_id.as_deref())
            .await
        {
            Ok(node_id) => node_id,
            Err(e) => {
                self.inner
                    .coordinator
                    .release_lock(&key, &self.inner.owner)
                    .await;
                tracing::warn!(job_id = %job_id, error = %e, "Job rejected");
                return Err(e);
            }
        };

        let complexity = analysis.complexity;
        let mut job = Job::with_id(job_id, request, analysis, template.name.clone());
        job.node_id = Some(node_id.clone());

        // Launch under the table lock so the run's outcome always finds
        // its job.
        let mut jobs = self.inner.jobs.write().await;
        let launched = if self.is_draining() {
            Err(OrchestratorError::AdmissionClosed(
                "orchestrator is shutting down".to_string(),
            ))
        } else {
            self.launch(&mut job)
        };
        if let Err(e) = launched {
            drop(jobs);
            self.release_job(&mut job).await;
            return Err(e);
        }
        job.transition(JobState::Processing);
        let workflow = job.workflow.clone();
        jobs.insert(job);
        drop(jobs);

        self.inner.events.jobs().publish(JobEvent::Accepted {
            job_id,
            workflow: workflow.clone(),
        });
        self.inner.events.jobs().publish(JobEvent::Started {
            job_id,
            node_id: node_id.clone(),
        });
        tracing::info!(
            job_id = %job_id,
            workflow = %workflow,
            complexity = %complexity,
            node_id = %node_id,
            "Job accepted"
        );
        Ok(job_id)
    }

    /// Cancel a job. Returns `false` when it had already finished.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        self.cancel_job(job_id, None).await
    }

    async fn cancel_job(&self, job_id: Uuid, reason: Option<&str>) -> Result<bool> {
        let mut jobs = self.inner.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        if job.is_terminal() {
            return Ok(false);
        }
        // Terminal transition clears the execution id, so the run's own
        // outcome is ignored when it arrives.
        job.transition(JobState::Cancelled);
        if let Some(reason) = reason {
            job.error = Some(reason.to_string());
        }
        self.retire_execution(job_id).await;
        self.release_job(job).await;
        drop(jobs);

        self.inner
            .events
            .jobs()
            .publish(JobEvent::Cancelled { job_id });
        tracing::info!(job_id = %job_id, "Job cancelled");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// Allocate on the pool's best node, then let the selector choose among
    /// the nodes able to host the grant and move it there.
    async fn place_new(
        &self,
        job_id: Uuid,
        req: &ResourceRequirements,
        hash_key: Option<&str>,
    ) -> Result<String> {
        let mut pool = self.inner.pool.write().await;
        let allocation = pool.allocate(job_id, req)?;
        let candidates = pool.candidates_for(job_id, req);

        let mut selector = self.inner.selector.lock().await;
        let Some(chosen) = selector.select_node(&candidates, Some(req), hash_key) else {
            pool.release(job_id);
            return Err(OrchestratorError::NoNodeAvailable(
                "no eligible node for the allocated resources".to_string(),
            ));
        };
        if chosen != allocation.node_id {
            if let Err(e) = pool.transfer(job_id, &chosen) {
                selector.release_connection(&chosen);
                pool.release(job_id);
                return Err(e);
            }
        }
        Ok(chosen)
    }

    /// Move a job's placement to a freshly selected node, preferring one other
    /// than its current node. On failure the job holds no grant and no node.
    async fn place_again(&self, job: &mut Job, placement: Placement) -> Result<String> {
        let req = job.analysis.requirements;
        let current = job.node_id.take();

        let mut pool = self.inner.pool.write().await;
        let mut candidates = pool.candidates_for(job.id, &req);
        if placement == Placement::HealthyOnly {
            candidates.retain(|n| n.status == HealthStatus::Healthy);
        }
        if let Some(cur) = &current {
            if candidates.iter().any(|n| &n.id != cur) {
                candidates.retain(|n| &n.id != cur);
            }
        }

        let mut selector = self.inner.selector.lock().await;
        if let Some(cur) = &current {
            selector.release_connection(cur);
        }
        let chosen = selector.select_node(
            &candidates,
            Some(&req),
            job.request.client_id.as_deref(),
        );
        let Some(target) = chosen else {
            pool.release(job.id);
            return Err(OrchestratorError::NoNodeAvailable(match placement {
                Placement::HealthyOnly => "no healthy nodes available".to_string(),
                Placement::Schedulable => format!("no node can host job {}", job.id),
            }));
        };

        let placed = if pool.allocation(job.id).is_some() {
            pool.transfer(job.id, &target)
        } else {
            pool.allocate_on(job.id, &target, &req)
        };
        if let Err(e) = placed {
            selector.release_connection(&target);
            pool.release(job.id);
            return Err(e);
        }
        job.node_id = Some(target.clone());
        Ok(target)
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    fn executions(&self) -> MutexGuard<'_, HashMap<Uuid, Execution>> {
        self.inner
            .executions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a fresh workflow run for `job` on its current node under the
    /// resilience policy, and make it the job's current execution.
    fn launch(&self, job: &mut Job) -> Result<Uuid> {
        let template = self
            .inner
            .catalog
            .get(&job.workflow)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(job.workflow.clone()))?;
        let node_id = job.node_id.clone().ok_or_else(|| {
            OrchestratorError::NoNodeAvailable(format!("job {} has no node", job.id))
        })?;

        let job_id = job.id;
        let execution_id = Uuid::new_v4();
        let ctx = WorkflowContext {
            job_id,
            execution_id,
            node_id,
            request: job.request.clone(),
            analysis: Arc::new(job.analysis.clone()),
        };
        let token = CancellationToken::new();
        let run_token = token.clone();
        let runner = self.inner.runner.clone();
        let resilience = self.inner.resilience.clone();
        let tx = self.inner.outcome_tx.clone();

        // Insert under the same guard as the spawn so an early outcome
        // always finds its execution entry.
        let mut executions = self.executions();
        let handle = tokio::spawn(async move {
            let label = template.name.clone();
            let attempt_token = run_token.clone();
            let result = resilience
                .run(&label, &run_token, move |attempt| {
                    let runner = runner.clone();
                    let template = template.clone();
                    let ctx = ctx.clone();
                    let token = attempt_token.clone();
                    async move {
                        if attempt > 1 {
                            tracing::debug!(job_id = %ctx.job_id, attempt, "Re-running workflow");
                        }
                        runner.execute(&template, ctx, token).await
                    }
                })
                .await;
            let outcome = match result {
                Ok(_) => RunOutcome::Completed {
                    job_id,
                    execution_id,
                },
                Err(e) => RunOutcome::Failed {
                    job_id,
                    execution_id,
                    error: e.to_string(),
                },
            };
            if tx.send(outcome).is_err() {
                tracing::debug!(job_id = %job_id, "Orchestrator gone, dropping run outcome");
            }
        });
        executions.insert(
            job_id,
            Execution {
                execution_id,
                token,
                handle,
            },
        );
        drop(executions);

        job.execution_id = Some(execution_id);
        Ok(execution_id)
    }

    /// Cancel a job's in-flight run and wait for it to stop.
    async fn retire_execution(&self, job_id: Uuid) {
        let execution = self.executions().remove(&job_id);
        if let Some(execution) = execution {
            execution.token.cancel();
            if let Err(e) = execution.handle.await {
                tracing::warn!(job_id = %job_id, error = %e, "Workflow run task ended abnormally");
            }
        }
    }

    fn forget_execution(&self, job_id: Uuid, execution_id: Uuid) {
        let mut executions = self.executions();
        if executions
            .get(&job_id)
            .is_some_and(|e| e.execution_id == execution_id)
        {
            executions.remove(&job_id);
        }
    }

    /// Give back everything a job holds: its grant, its selector connection
    /// and its coordination lock.
    async fn release_job(&self, job: &mut Job) {
        self.inner.pool.write().await.release(job.id);
        if let Some(node_id) = job.node_id.as_deref() {
            self.inner.selector.lock().await.release_connection(node_id);
        }
        self.inner
            .coordinator
            .release_lock(&lock_key(job.id), &self.inner.owner)
            .await;
    }

    // ------------------------------------------------------------------
    // Lifecycle transitions
    // ------------------------------------------------------------------

    async fn finish_failed(&self, job: &mut Job, error: String) {
        job.fail(JobState::Failed, error.clone());
        self.release_job(job).await;
        tracing::error!(job_id = %job.id, retries = job.retries, error = %error, "Job failed");
        self.inner.events.jobs().publish(JobEvent::Failed {
            job_id: job.id,
            error,
        });
    }

    /// Place a job on another node and start a fresh run there, or fail it
    /// when no node qualifies. The old run must already be retired.
    async fn relocate(&self, job: &mut Job, placement: Placement) {
        let from = job.node_id.clone();
        let to = match self.place_again(job, placement).await {
            Ok(to) => to,
            Err(e) => {
                self.finish_failed(job, e.to_string()).await;
                return;
            }
        };
        if let Err(e) = self.launch(job) {
            self.finish_failed(job, e.to_string()).await;
            return;
        }
        if job.state != JobState::Processing {
            job.transition(JobState::Processing);
        }

        let from = from.unwrap_or_default();
        tracing::info!(job_id = %job.id, from = %from, to = %to, "Job reassigned");
        if from != to {
            self.inner.events.jobs().publish(JobEvent::Reassigned {
                job_id: job.id,
                from,
                to: to.clone(),
            });
        }
        self.inner.events.jobs().publish(JobEvent::Started {
            job_id: job.id,
            node_id: to,
        });
    }

    async fn handle_outcome(&self, outcome: RunOutcome) {
        let (job_id, execution_id) = outcome.ids();
        let mut jobs = self.inner.jobs.write().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            tracing::debug!(job_id = %job_id, "Outcome for untracked job");
            return;
        };
        if job.execution_id != Some(execution_id) {
            tracing::debug!(
                job_id = %job_id,
                execution_id = %execution_id,
                "Ignoring outcome of retired workflow run"
            );
            return;
        }
        self.forget_execution(job_id, execution_id);

        match outcome {
            RunOutcome::Completed { .. } => {
                job.transition(JobState::Completed);
                job.error = None;
                self.release_job(job).await;
                tracing::info!(job_id = %job_id, retries = job.retries, "Job completed");
                self.inner
                    .events
                    .jobs()
                    .publish(JobEvent::Completed { job_id });
            }
            RunOutcome::Failed { error, .. } => {
                let config = &self.inner.config;
                if config.auto_recovery && job.retries < config.max_job_retries {
                    job.retries += 1;
                    job.error = Some(error.clone());
                    job.transition(JobState::Retrying);
                    tracing::warn!(
                        job_id = %job_id,
                        attempt = job.retries,
                        max_retries = config.max_job_retries,
                        error = %error,
                        "Job failed, retrying"
                    );
                    self.inner.events.jobs().publish(JobEvent::Retrying {
                        job_id,
                        attempt: job.retries,
                        reason: error,
                    });
                    self.relocate(job, Placement::Schedulable).await;
                } else {
                    self.finish_failed(job, error).await;
                }
            }
        }
    }

    async fn handle_node_event(&self, event: NodeEvent) {
        let (node_id, orphaned, placement) = match event {
            NodeEvent::Unhealthy { node_id } => (node_id, None, Placement::HealthyOnly),
            NodeEvent::Left {
                node_id,
                orphaned_jobs,
            } => (node_id, Some(orphaned_jobs), Placement::Schedulable),
            NodeEvent::Joined { .. } | NodeEvent::StatusChanged { .. } => return,
        };

        let mut jobs = self.inner.jobs.write().await;
        let mut affected = jobs.active_on_node(&node_id);
        if let Some(orphaned) = orphaned {
            for id in orphaned {
                if !affected.contains(&id) && jobs.get(&id).is_some_and(|j| !j.is_terminal()) {
                    affected.push(id);
                }
            }
        }
        if affected.is_empty() {
            return;
        }
        tracing::warn!(node_id = %node_id, jobs = affected.len(), "Reassigning jobs from lost node");

        for job_id in affected {
            self.retire_execution(job_id).await;
            if let Some(job) = jobs.get_mut(&job_id) {
                self.relocate(job, placement).await;
            }
        }
    }

    async fn handle_resource_event(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::Alert(alert) if alert.severity == AlertSeverity::Critical => {
                self.inner.admission_limit.store(0, Ordering::SeqCst);
                tracing::warn!(
                    resource = %alert.resource,
                    utilization = alert.utilization,
                    "Critical resource alert, halting admission"
                );
            }
            ResourceEvent::Alert(alert) => {
                tracing::warn!(
                    resource = %alert.resource,
                    utilization = alert.utilization,
                    "Resource warning, rebalancing"
                );
                self.inner
                    .admission_limit
                    .store(self.inner.config.max_concurrent_jobs, Ordering::SeqCst);
                self.rebalance().await;
            }
            ResourceEvent::Recovered => {
                self.inner
                    .admission_limit
                    .store(self.inner.config.max_concurrent_jobs, Ordering::SeqCst);
                tracing::info!(
                    limit = self.inner.config.max_concurrent_jobs,
                    "Resources recovered, admission restored"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Move at most one job off each overloaded node, restarting its
    /// workflow from scratch on the target. Returns the number moved.
    pub async fn rebalance(&self) -> usize {
        let mut jobs = self.inner.jobs.write().await;
        let load: BTreeMap<String, usize> = self
            .inner
            .pool
            .read()
            .await
            .schedulable_nodes()
            .iter()
            .map(|n| (n.id.clone(), n.job_count()))
            .collect();
        let plan = rebalance::plan(
            &load,
            self.inner.config.overload_factor,
            self.inner.config.underload_factor,
        );
        if plan.migrations.is_empty() {
            return 0;
        }
        tracing::debug!(
            mean = plan.mean,
            overloaded = plan.overloaded.len(),
            underloaded = plan.underloaded.len(),
            "Rebalancing"
        );

        let mut moved = 0;
        for migration in plan.migrations {
            // Newest job first: it has the least progress to lose.
            let Some(job_id) = jobs.active_on_node(&migration.from).last().copied() else {
                continue;
            };
            let Some(req) = jobs.get(&job_id).map(|j| j.analysis.requirements) else {
                continue;
            };
            let fits = self
                .inner
                .pool
                .read()
                .await
                .candidates_for(job_id, &req)
                .iter()
                .any(|n| n.id == migration.to);
            if !fits {
                continue;
            }

            self.retire_execution(job_id).await;
            let Some(job) = jobs.get_mut(&job_id) else {
                continue;
            };
            let transferred = {
                let mut pool = self.inner.pool.write().await;
                match pool.transfer(job_id, &migration.to) {
                    Ok(_) => {
                        let mut selector = self.inner.selector.lock().await;
                        selector.release_connection(&migration.from);
                        selector.record_connection(&migration.to);
                        true
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Migration failed, restarting in place");
                        false
                    }
                }
            };
            if transferred {
                job.node_id = Some(migration.to.clone());
            }
            if let Err(e) = self.launch(job) {
                self.finish_failed(job, e.to_string()).await;
                continue;
            }
            if transferred {
                moved += 1;
                tracing::info!(job_id = %job_id, from = %migration.from, to = %migration.to, "Job migrated");
                self.inner.events.jobs().publish(JobEvent::Reassigned {
                    job_id,
                    from: migration.from.clone(),
                    to: migration.to.clone(),
                });
            }
        }
        moved
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        let metrics = self.inner.analytics.metrics().await;
        let jobs = self.inner.jobs.read().await.summaries();
        let nodes = self.inner.pool.read().await.nodes().cloned().collect();
        let locks = self.inner.coordinator.locks().await;
        StateSnapshot {
            taken_at: Utc::now(),
            jobs,
            nodes,
            metrics,
            locks,
        }
    }

    /// One periodic pass: metrics, predictive scaling, rebalancing, purge of
    /// expired terminal jobs, snapshot.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let metrics = self.inner.analytics.metrics().await;
        tracing::debug!(
            active_jobs = metrics.active_jobs,
            nodes = metrics.node_count,
            cpu = metrics.utilization.cpu,
            memory = metrics.utilization.memory,
            "Maintenance tick"
        );

        if self.inner.config.predictive_scaling {
            let prediction = self.inner.analytics.predictions().await;
            if prediction.confidence >= self.inner.config.scaling_confidence {
                let mut pool = self.inner.pool.write().await;
                match prediction.action {
                    ScalingAction::ScaleUp => {
                        report.scaled_up = pool.scale_up(prediction.node_count).len();
                    }
                    ScalingAction::ScaleDown => {
                        report.scaled_down = pool.scale_down(prediction.node_count).len();
                    }
                    ScalingAction::Maintain => {}
                }
            }
        }

        report.migrated = self.rebalance().await;
        report.purged = self
            .inner
            .jobs
            .write()
            .await
            .purge_terminal(self.inner.config.job_retention());
        if report.purged > 0 {
            tracing::debug!(purged = report.purged, "Purged finished jobs");
        }

        let snapshot = self.snapshot().await;
        match self.inner.coordinator.save_snapshot(snapshot).await {
            Ok(()) => report.snapshot_saved = true,
            Err(e) => tracing::warn!(error = %e, "Failed to save state snapshot"),
        }
        report
    }

    // ------------------------------------------------------------------
    // Process lifecycle
    // ------------------------------------------------------------------

    /// Spawn the event loop and the resource monitor. Cancelling `shutdown`
    /// stops admission; [`Orchestrator::shutdown`] completes the stop.
    pub fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let outcomes = self
            .inner
            .outcome_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| OrchestratorError::Config("orchestrator already started".to_string()))?;
        let node_events = self.inner.events.nodes().subscribe();
        let resource_events = self.inner.events.resources().subscribe();

        let this = self.clone();
        let event_loop = tokio::spawn(async move {
            this.event_loop(outcomes, node_events, resource_events, shutdown)
                .await;
        });

        let monitor = ResourceMonitor::new(
            self.inner.pool.clone(),
            self.inner.config.pool.monitor_interval_ms,
        );
        let stop = self.inner.stop.clone();
        let monitor_task = tokio::spawn(async move {
            monitor.run(stop).await;
        });

        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend([event_loop, monitor_task]);
        tracing::info!(
            tick_ms = self.inner.config.tick_interval_ms,
            strategy = %self.inner.config.balancer.strategy,
            "Orchestrator started"
        );
        Ok(())
    }

    async fn event_loop(
        self,
        mut outcomes: mpsc::UnboundedReceiver<RunOutcome>,
        mut node_events: mpsc::UnboundedReceiver<NodeEvent>,
        mut resource_events: mpsc::UnboundedReceiver<ResourceEvent>,
        shutdown: CancellationToken,
    ) {
        let period = self.inner.config.tick_interval();
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut signalled = false;

        loop {
            tokio::select! {
                _ = self.inner.stop.cancelled() => break,
                _ = shutdown.cancelled(), if !signalled => {
                    signalled = true;
                    self.inner.draining.store(true, Ordering::SeqCst);
                    tracing::info!("Shutdown requested, no longer accepting jobs");
                }
                Some(outcome) = outcomes.recv() => self.handle_outcome(outcome).await,
                Some(event) = node_events.recv() => self.handle_node_event(event).await,
                Some(event) = resource_events.recv() => self.handle_resource_event(event).await,
                _ = tick.tick() => {
                    self.run_maintenance().await;
                }
            }
        }
        tracing::debug!("Orchestrator event loop stopped");
    }

    /// Stop admission, wait up to `timeout` for active jobs to finish, cancel
    /// the rest, then stop the background tasks.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.draining.store(true, Ordering::SeqCst);
        let active = self.active_jobs().await;
        tracing::info!(active, timeout_ms = timeout.as_millis() as u64, "Draining jobs");

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let active = self.active_jobs().await;
            if active == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(active, "Drain timeout reached, cancelling remaining jobs");
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let remaining: Vec<Uuid> = self
            .inner
            .jobs
            .read()
            .await
            .active()
            .map(|j| j.id)
            .collect();
        for job_id in remaining {
            if let Err(e) = self
                .cancel_job(job_id, Some("cancelled during shutdown"))
                .await
            {
                tracing::debug!(job_id = %job_id, error = %e, "Could not cancel job");
            }
        }

        self.inner.stop.cancel();
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Orchestrator stopped");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("owner", &self.inner.owner)
            .field("admission_limit", &self.admission_limit())
            .field("draining", &self.is_draining())
            .finish()
    }
}
