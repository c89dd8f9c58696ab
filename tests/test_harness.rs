//! Shared helpers for orchestrator integration tests.
//!
//! Provides polling assertions, node and request builders, and a scripted
//! step handler that records every attempt it sees.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mediaflow::config::{NodeProfile, OrchestratorConfig};
use mediaflow::job::{ElementKind, JobAnalyzer, JobRequest, OutputFormat};
use mediaflow::orchestrator::Orchestrator;
use mediaflow::resources::WorkerNode;
use mediaflow::worker::{StepContext, StepError, StepExecutor, StepHandler};
use mediaflow::workflow::{
    RetryPolicy, StepKind, WorkflowCatalog, WorkflowContext, WorkflowStep, WorkflowTemplate,
};

/// Config with fast background tasks and no workflow-level retries.
/// The maintenance tick is long so tests drive maintenance explicitly.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default().with_tick_interval(60_000);
    config.pool.monitor_interval_ms = 20;
    config.resilience.max_attempts = 1;
    config.resilience.retry_delay_ms = 1;
    config.resilience.breaker_failure_threshold = 1_000;
    config
}

pub fn node(id: &str) -> WorkerNode {
    WorkerNode::new(id, id, &NodeProfile::default())
}

/// A node with the given cpu (millicores) and memory (MiB) and no accelerator.
pub fn sized_node(id: &str, cpu_millis: u64, memory_mb: u64) -> WorkerNode {
    let profile = NodeProfile {
        cpu_millis,
        memory_mb,
        gpu_units: 0,
        ..NodeProfile::default()
    };
    WorkerNode::new(id, id, &profile)
}

/// One text element at 480p: low complexity, routed to `fast-sync`.
pub fn small_request() -> JobRequest {
    JobRequest::new(OutputFormat::Mp4, 640, 480).with_elements(ElementKind::Text, 1)
}

/// Four images at 720p: medium complexity, routed to `balanced-async`.
pub fn medium_request() -> JobRequest {
    JobRequest::new(OutputFormat::Webm, 1280, 720).with_elements(ElementKind::Image, 4)
}

pub fn workflow_context(request: JobRequest, node_id: &str) -> WorkflowContext {
    let analysis = JobAnalyzer::new().analyze(&request);
    WorkflowContext {
        job_id: Uuid::new_v4(),
        execution_id: Uuid::new_v4(),
        node_id: node_id.to_string(),
        request: Arc::new(request),
        analysis: Arc::new(analysis),
    }
}

/// Sequential `a -> b -> c` template whose steps use `retry`.
pub fn chain_template(name: &str, retry: RetryPolicy) -> WorkflowTemplate {
    WorkflowTemplate::new(name, false)
        .with_step(WorkflowStep::new("a", StepKind::Process, 5_000).with_retry(retry.clone()))
        .with_step(
            WorkflowStep::new("b", StepKind::Process, 5_000)
                .after(["a"])
                .with_retry(retry.clone()),
        )
        .with_step(
            WorkflowStep::new("c", StepKind::Process, 5_000)
                .after(["b"])
                .with_retry(retry),
        )
}

/// Built-in catalog with `fast-sync` replaced by [`chain_template`].
pub fn chain_catalog(retry: RetryPolicy) -> WorkflowCatalog {
    let mut catalog = WorkflowCatalog::builtin();
    catalog
        .register(chain_template("fast-sync", retry))
        .expect("chain template is valid");
    catalog
}

/// Build and start an orchestrator over `nodes`.
pub async fn start_orchestrator(
    config: OrchestratorConfig,
    catalog: WorkflowCatalog,
    handler: Arc<ScriptedHandler>,
    nodes: Vec<WorkerNode>,
) -> (Orchestrator, CancellationToken) {
    let orchestrator = Orchestrator::builder(config)
        .with_catalog(catalog)
        .with_executor(StepExecutor::uniform(handler))
        .with_selector_seed(7)
        .build()
        .expect("orchestrator builds");
    for n in nodes {
        orchestrator.register_node(n).await.expect("node registers");
    }
    let token = CancellationToken::new();
    orchestrator.start(token.clone()).expect("orchestrator starts");
    (orchestrator, token)
}

/// Everything currently queued on `rx`.
pub fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

// =============================================================================
// Scripted step handler
// =============================================================================

#[derive(Debug, Clone)]
pub enum Script {
    /// Every attempt succeeds.
    Succeed,
    /// Attempts of this step id always fail; the rest succeed.
    FailStep(String),
    /// The first N attempts (across all steps) fail.
    FailFirst(u32),
    /// Attempts never finish on their own.
    Block,
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub job_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub step_id: String,
    pub attempt: u32,
    pub started: Instant,
    pub finished: Option<Instant>,
    pub ok: bool,
}

#[derive(Debug)]
pub struct ScriptedHandler {
    script: Script,
    delay: Duration,
    failed: AtomicU32,
    records: Mutex<Vec<StepRecord>>,
}

impl ScriptedHandler {
    pub fn new(script: Script, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script,
            delay,
            failed: AtomicU32::new(0),
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn succeed(delay: Duration) -> Arc<Self> {
        Self::new(Script::Succeed, delay)
    }

    pub fn fail_step(step_id: &str) -> Arc<Self> {
        Self::new(Script::FailStep(step_id.to_string()), Duration::from_millis(1))
    }

    pub fn fail_first(n: u32) -> Arc<Self> {
        Self::new(Script::FailFirst(n), Duration::from_millis(1))
    }

    pub fn blocking() -> Arc<Self> {
        Self::new(Script::Block, Duration::ZERO)
    }

    pub fn records(&self) -> Vec<StepRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn calls_for(&self, step_id: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.step_id == step_id)
            .count()
    }

    pub fn record_for(&self, step_id: &str) -> Option<StepRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.step_id == step_id && r.ok)
            .cloned()
    }

    fn push(&self, ctx: &StepContext, started: Instant) -> usize {
        let mut records = self.records.lock().unwrap();
        records.push(StepRecord {
            job_id: ctx.job_id,
            execution_id: ctx.execution_id,
            node_id: ctx.node_id.clone(),
            step_id: ctx.step_id.clone(),
            attempt: ctx.attempt,
            started,
            finished: None,
            ok: false,
        });
        records.len() - 1
    }

    fn finish(&self, index: usize, ok: bool) {
        let mut records = self.records.lock().unwrap();
        records[index].finished = Some(Instant::now());
        records[index].ok = ok;
    }
}

#[async_trait]
impl StepHandler for ScriptedHandler {
    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let index = self.push(ctx, Instant::now());
        if matches!(self.script, Script::Block) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let fail = match &self.script {
            Script::FailStep(step) => *step == ctx.step_id,
            Script::FailFirst(n) => self.failed.fetch_add(1, Ordering::SeqCst) < *n,
            Script::Succeed | Script::Block => false,
        };
        self.finish(index, !fail);
        if fail {
            return Err(StepError::failed(format!("scripted failure in {}", ctx.step_id)));
        }
        Ok(json!({ "step": ctx.step_id, "node": ctx.node_id }))
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
