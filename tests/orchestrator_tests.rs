mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use mediaflow::error::OrchestratorError;
use mediaflow::events::JobEvent;
use mediaflow::job::JobState;
use mediaflow::orchestrator::Orchestrator;
use mediaflow::resources::{HealthStatus, ResourceRequirements};
use mediaflow::services::{
    CoordinationService, InMemoryCoordinator, ScalingAction, ScalingPrediction, StaticAnalytics,
};
use mediaflow::worker::StepExecutor;
use mediaflow::workflow::{Backoff, RetryPolicy, WorkflowCatalog};
use test_harness::{
    assert_eventually, chain_catalog, drain, node, small_request, start_orchestrator,
    test_config, ScriptedHandler,
};

const SETTLE: Duration = Duration::from_secs(5);

async fn wait_for_state(orchestrator: &Orchestrator, job_id: Uuid, state: JobState) {
    let o = orchestrator.clone();
    assert_eventually(
        move || {
            let o = o.clone();
            async move { o.job_state(job_id).await == Some(state) }
        },
        SETTLE,
        &format!("job {job_id} never reached {state}"),
    )
    .await;
}

async fn wait_for_calls(handler: &Arc<ScriptedHandler>, calls: usize) {
    let h = handler.clone();
    assert_eventually(
        move || {
            let h = h.clone();
            async move { h.calls() >= calls }
        },
        SETTLE,
        &format!("handler never saw {calls} calls"),
    )
    .await;
}

async fn jobs_on(orchestrator: &Orchestrator, node_id: &str) -> Vec<Uuid> {
    orchestrator.pool().read().await.jobs_on(node_id)
}

#[tokio::test]
async fn test_job_completes_and_releases_everything() {
    let handler = ScriptedHandler::succeed(Duration::from_millis(5));
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let orchestrator = Orchestrator::builder(test_config())
        .with_executor(StepExecutor::uniform(handler.clone()))
        .with_coordinator(coordinator.clone())
        .build()
        .unwrap();
    orchestrator.register_node(node("a")).await.unwrap();
    let mut rx = orchestrator.events().jobs().subscribe();
    orchestrator.start(tokio_util::sync::CancellationToken::new()).unwrap();

    let job_id = orchestrator.submit(small_request()).await.unwrap();
    wait_for_state(&orchestrator, job_id, JobState::Completed).await;

    let summary = orchestrator.job(job_id).await.unwrap();
    assert_eq!(summary.workflow, "fast-sync");
    assert_eq!(summary.retries, 0);
    assert!(summary.error.is_none());
    assert_eq!(handler.calls(), 5);

    let pool = orchestrator.pool();
    let pool = pool.read().await;
    assert!(pool.allocation(job_id).is_none());
    assert_eq!(pool.node("a").unwrap().job_count(), 0);
    assert!(pool.check_invariants());
    drop(pool);
    assert!(coordinator.locks().await.is_empty());

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(JobEvent::Accepted { workflow, .. }) if workflow == "fast-sync"));
    assert!(matches!(events.last(), Some(JobEvent::Completed { job_id: id }) if *id == job_id));

    orchestrator.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_failing_job_retries_then_fails() {
    let handler = ScriptedHandler::fail_step("b");
    let config = test_config().with_max_job_retries(2);
    let catalog = chain_catalog(RetryPolicy::new(2, Backoff::Fixed, 1, 10));
    let (orchestrator, _token) =
        start_orchestrator(config, catalog, handler.clone(), vec![node("a"), node("b")]).await;
    let mut rx = orchestrator.events().jobs().subscribe();

    let job_id = orchestrator.submit(small_request()).await.unwrap();
    wait_for_state(&orchestrator, job_id, JobState::Failed).await;

    let summary = orchestrator.job(job_id).await.unwrap();
    assert_eq!(summary.retries, 2);
    assert!(summary.error.unwrap().contains("Step 'b' failed after 2 attempt(s)"));
    // Three workflow runs, each trying b twice and never reaching c.
    assert_eq!(handler.calls_for("a"), 3);
    assert_eq!(handler.calls_for("b"), 6);
    assert_eq!(handler.calls_for("c"), 0);

    let events = drain(&mut rx);
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Retrying { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
    assert!(matches!(events.last(), Some(JobEvent::Failed { .. })));
    assert!(orchestrator.pool().read().await.allocation(job_id).is_none());

    orchestrator.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_flaky_job_recovers_on_retry() {
    let handler = ScriptedHandler::fail_first(1);
    let catalog = chain_catalog(RetryPolicy::none());
    let (orchestrator, _token) =
        start_orchestrator(test_config(), catalog, handler.clone(), vec![node("a")]).await;

    let job_id = orchestrator.submit(small_request()).await.unwrap();
    wait_for_state(&orchestrator, job_id, JobState::Completed).await;

    let summary = orchestrator.job(job_id).await.unwrap();
    assert_eq!(summary.retries, 1);
    assert!(summary.error.is_none());

    orchestrator.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_unhealthy_node_jobs_move_to_healthy_nodes() {
    let handler = ScriptedHandler::blocking();
    let (orchestrator, _token) = start_orchestrator(
        test_config(),
        WorkflowCatalog::builtin(),
        handler.clone(),
        vec![node("a")],
    )
    .await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(orchestrator.submit(small_request()).await.unwrap());
    }
    wait_for_calls(&handler, 3).await;
    assert_eq!(jobs_on(&orchestrator, "a").await.len(), 3);

    orchestrator.register_node(node("b")).await.unwrap();
    orchestrator.register_node(node("c")).await.unwrap();
    let mut rx = orchestrator.events().jobs().subscribe();
    orchestrator
        .apply_health_signal("a", HealthStatus::Unhealthy)
        .await
        .unwrap();

    let o = orchestrator.clone();
    assert_eventually(
        move || {
            let o = o.clone();
            async move { o.pool().read().await.jobs_on("a").is_empty() }
        },
        SETTLE,
        "jobs still placed on the unhealthy node",
    )
    .await;

    for id in &ids {
        let summary = orchestrator.job(*id).await.unwrap();
        assert_eq!(summary.state, JobState::Processing);
        assert!(matches!(summary.node_id.as_deref(), Some("b") | Some("c")));
    }
    let reassigned = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, JobEvent::Reassigned { from, .. } if from == "a"))
        .count();
    assert_eq!(reassigned, 3);
    wait_for_calls(&handler, 6).await;
    assert!(orchestrator.pool().read().await.check_invariants());

    orchestrator.shutdown(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_unhealthy_sole_node_fails_its_jobs() {
    let handler = ScriptedHandler::blocking();
    let (orchestrator, _token) = start_orchestrator(
        test_config(),
        WorkflowCatalog::builtin(),
        handler.clone(),
        vec![node("a")],
    )
    .await;

    let job_id = orchestrator.submit(small_request()).await.unwrap();
    wait_for_calls(&handler, 1).await;
    orchestrator
        .apply_health_signal("a", HealthStatus::Unhealthy)
        .await
        .unwrap();

    wait_for_state(&orchestrator, job_id, JobState::Failed).await;
    let summary = orchestrator.job(job_id).await.unwrap();
    assert!(summary.error.unwrap().contains("no healthy nodes available"));
    assert!(orchestrator.pool().read().await.allocation(job_id).is_none());

    orchestrator.shutdown(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_departed_node_jobs_are_relocated() {
    let handler = ScriptedHandler::blocking();
    let (orchestrator, _token) = start_orchestrator(
        test_config(),
        WorkflowCatalog::builtin(),
        handler.clone(),
        vec![node("a")],
    )
    .await;

    let first = orchestrator.submit(small_request()).await.unwrap();
    let second = orchestrator.submit(small_request()).await.unwrap();
    wait_for_calls(&handler, 2).await;

    orchestrator.register_node(node("b")).await.unwrap();
    let orphaned = orchestrator.unregister_node("a").await.unwrap();
    assert_eq!(orphaned.len(), 2);

    let o = orchestrator.clone();
    assert_eventually(
        move || {
            let o = o.clone();
            async move { o.pool().read().await.jobs_on("b").len() == 2 }
        },
        SETTLE,
        "orphaned jobs were not placed on the remaining node",
    )
    .await;
    for id in [first, second] {
        assert_eq!(orchestrator.job(id).await.unwrap().node_id.as_deref(), Some("b"));
    }

    orchestrator.shutdown(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_releases_resources() {
    let handler = ScriptedHandler::blocking();
    let (orchestrator, _token) = start_orchestrator(
        test_config(),
        WorkflowCatalog::builtin(),
        handler.clone(),
        vec![node("a")],
    )
    .await;

    let job_id = orchestrator.submit(small_request()).await.unwrap();
    wait_for_calls(&handler, 1).await;

    assert!(orchestrator.cancel(job_id).await.unwrap());
    assert_eq!(orchestrator.job_state(job_id).await, Some(JobState::Cancelled));
    assert!(!orchestrator.cancel(job_id).await.unwrap());
    assert!(orchestrator.pool().read().await.allocation(job_id).is_none());
    assert_eq!(orchestrator.active_jobs().await, 0);

    let unknown = Uuid::new_v4();
    assert!(matches!(
        orchestrator.cancel(unknown).await,
        Err(OrchestratorError::JobNotFound(id)) if id == unknown
    ));

    orchestrator.shutdown(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_admission_limit_rejects_excess_jobs() {
    let mut config = test_config();
    config.max_concurrent_jobs = 2;
    let (orchestrator, _token) = start_orchestrator(
        config,
        WorkflowCatalog::builtin(),
        ScriptedHandler::blocking(),
        vec![node("a"), node("b")],
    )
    .await;

    let first = orchestrator.submit(small_request()).await.unwrap();
    orchestrator.submit(small_request()).await.unwrap();
    assert!(matches!(
        orchestrator.submit(small_request()).await,
        Err(OrchestratorError::AdmissionClosed(_))
    ));

    orchestrator.cancel(first).await.unwrap();
    assert!(orchestrator.submit(small_request()).await.is_ok());

    orchestrator.shutdown(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_no_capacity_rejects_without_side_effects() {
    let mut config = test_config();
    config.max_concurrent_jobs = 10;
    let (orchestrator, _token) = start_orchestrator(
        config,
        WorkflowCatalog::builtin(),
        ScriptedHandler::blocking(),
        vec![test_harness::sized_node("tiny", 500, 512)],
    )
    .await;

    let err = orchestrator.submit(small_request()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceExhausted(_)), "{err}");
    assert!(orchestrator.jobs().await.is_empty());
    assert_eq!(orchestrator.pool().read().await.allocations().count(), 0);

    orchestrator.shutdown(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_critical_alert_halts_admission_until_recovery() {
    let mut config = test_config();
    config.pool.warning_utilization = 0.3;
    config.pool.critical_utilization = 0.6;
    let max = config.max_concurrent_jobs;
    let (orchestrator, _token) = start_orchestrator(
        config,
        WorkflowCatalog::builtin(),
        ScriptedHandler::blocking(),
        vec![node("a")],
    )
    .await;

    let hog = Uuid::new_v4();
    orchestrator
        .pool()
        .write()
        .await
        .allocate(hog, &ResourceRequirements::new(6_000, 1_024, 0, 0))
        .unwrap();

    let o = orchestrator.clone();
    assert_eventually(
        move || {
            let o = o.clone();
            async move { o.admission_limit() == 0 }
        },
        SETTLE,
        "critical alert did not halt admission",
    )
    .await;
    match orchestrator.submit(small_request()).await {
        Err(OrchestratorError::AdmissionClosed(reason)) => assert!(reason.contains("critical")),
        other => panic!("expected admission to be closed, got {other:?}"),
    }

    orchestrator.pool().write().await.release(hog);
    let o = orchestrator.clone();
    assert_eventually(
        move || {
            let o = o.clone();
            async move { o.admission_limit() == max }
        },
        SETTLE,
        "admission was not restored after recovery",
    )
    .await;
    assert!(orchestrator.submit(small_request()).await.is_ok());

    orchestrator.shutdown(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_rebalance_moves_one_job_off_overloaded_node() {
    let handler = ScriptedHandler::blocking();
    let (orchestrator, _token) = start_orchestrator(
        test_config(),
        WorkflowCatalog::builtin(),
        handler.clone(),
        vec![node("a")],
    )
    .await;

    for _ in 0..4 {
        orchestrator.submit(small_request()).await.unwrap();
    }
    wait_for_calls(&handler, 4).await;
    orchestrator.register_node(node("b")).await.unwrap();
    orchestrator.register_node(node("c")).await.unwrap();
    let mut rx = orchestrator.events().jobs().subscribe();

    assert_eq!(orchestrator.rebalance().await, 1);
    assert_eq!(jobs_on(&orchestrator, "a").await.len(), 3);
    assert_eq!(jobs_on(&orchestrator, "b").await.len(), 1);
    let moved: Vec<JobEvent> = drain(&mut rx);
    assert!(matches!(
        moved.as_slice(),
        [JobEvent::Reassigned { from, to, .. }] if from == "a" && to == "b"
    ));
    // The moved job restarts its workflow on the new node.
    wait_for_calls(&handler, 5).await;
    assert_eq!(handler.records().last().unwrap().node_id, "b");

    orchestrator.shutdown(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_maintenance_purges_and_snapshots() {
    let mut config = test_config();
    config.job_retention_secs = 0;
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let orchestrator = Orchestrator::builder(config)
        .with_executor(StepExecutor::uniform(ScriptedHandler::succeed(Duration::ZERO)))
        .with_coordinator(coordinator.clone())
        .build()
        .unwrap();
    orchestrator.register_node(node("a")).await.unwrap();
    orchestrator.start(tokio_util::sync::CancellationToken::new()).unwrap();

    let job_id = orchestrator.submit(small_request()).await.unwrap();
    wait_for_state(&orchestrator, job_id, JobState::Completed).await;

    let report = orchestrator.run_maintenance().await;
    assert_eq!(report.purged, 1);
    assert!(report.snapshot_saved);
    assert!(orchestrator.job(job_id).await.is_none());

    let snapshot = coordinator.latest_snapshot().await.unwrap();
    assert_eq!(snapshot.nodes.len(), 1);
    assert!(snapshot.jobs.is_empty());
    assert!(snapshot.locks.is_empty());

    orchestrator.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_predictive_scaling_follows_confident_advice() {
    let mut config = test_config();
    config.predictive_scaling = true;
    config.scaling_confidence = 0.8;
    let analytics = Arc::new(StaticAnalytics::new());
    let orchestrator = Orchestrator::builder(config)
        .with_executor(StepExecutor::uniform(ScriptedHandler::blocking()))
        .with_analytics(analytics.clone())
        .build()
        .unwrap();
    orchestrator.register_node(node("a")).await.unwrap();

    analytics
        .set_prediction(ScalingPrediction {
            action: ScalingAction::ScaleUp,
            node_count: 2,
            confidence: 0.9,
        })
        .await;
    assert_eq!(orchestrator.run_maintenance().await.scaled_up, 2);
    assert_eq!(orchestrator.pool().read().await.node_count(), 3);

    analytics
        .set_prediction(ScalingPrediction {
            action: ScalingAction::ScaleUp,
            node_count: 5,
            confidence: 0.5,
        })
        .await;
    assert_eq!(orchestrator.run_maintenance().await.scaled_up, 0);

    analytics
        .set_prediction(ScalingPrediction {
            action: ScalingAction::ScaleDown,
            node_count: 5,
            confidence: 0.95,
        })
        .await;
    // Only the idle elastic nodes go; the registered node stays.
    assert_eq!(orchestrator.run_maintenance().await.scaled_down, 2);
    let pool = orchestrator.pool();
    let pool = pool.read().await;
    assert_eq!(pool.node_count(), 1);
    assert!(pool.node("a").is_some());
}

#[tokio::test]
async fn test_shutdown_drains_running_jobs() {
    let handler = ScriptedHandler::succeed(Duration::from_millis(30));
    let (orchestrator, _token) = start_orchestrator(
        test_config(),
        WorkflowCatalog::builtin(),
        handler,
        vec![node("a"), node("b")],
    )
    .await;

    let ids = vec![
        orchestrator.submit(small_request()).await.unwrap(),
        orchestrator.submit(small_request()).await.unwrap(),
    ];
    orchestrator.shutdown(Duration::from_secs(5)).await;

    for id in ids {
        assert_eq!(orchestrator.job_state(id).await, Some(JobState::Completed));
    }
    assert!(orchestrator.is_draining());
    assert!(matches!(
        orchestrator.submit(small_request()).await,
        Err(OrchestratorError::AdmissionClosed(_))
    ));
}

#[tokio::test]
async fn test_shutdown_timeout_cancels_stuck_jobs() {
    let handler = ScriptedHandler::blocking();
    let (orchestrator, _token) = start_orchestrator(
        test_config(),
        WorkflowCatalog::builtin(),
        handler.clone(),
        vec![node("a")],
    )
    .await;

    let job_id = orchestrator.submit(small_request()).await.unwrap();
    wait_for_calls(&handler, 1).await;
    orchestrator.shutdown(Duration::from_millis(100)).await;

    let summary = orchestrator.job(job_id).await.unwrap();
    assert_eq!(summary.state, JobState::Cancelled);
    assert_eq!(summary.error.as_deref(), Some("cancelled during shutdown"));
    assert_eq!(orchestrator.active_jobs().await, 0);
}

#[tokio::test]
async fn test_shutdown_signal_stops_admission() {
    let (orchestrator, token) = start_orchestrator(
        test_config(),
        WorkflowCatalog::builtin(),
        ScriptedHandler::succeed(Duration::ZERO),
        vec![node("a")],
    )
    .await;

    token.cancel();
    let o = orchestrator.clone();
    assert_eventually(
        move || {
            let o = o.clone();
            async move { o.is_draining() }
        },
        SETTLE,
        "signal did not stop admission",
    )
    .await;
    assert!(matches!(
        orchestrator.submit(small_request()).await,
        Err(OrchestratorError::AdmissionClosed(_))
    ));
    orchestrator.shutdown(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_builder_rejects_incomplete_setup() {
    assert!(matches!(
        Orchestrator::builder(test_config()).build(),
        Err(OrchestratorError::Config(_))
    ));
    assert!(matches!(
        Orchestrator::builder(test_config())
            .with_catalog(WorkflowCatalog::new())
            .with_executor(StepExecutor::uniform(ScriptedHandler::blocking()))
            .build(),
        Err(OrchestratorError::Config(_))
    ));

    let (orchestrator, token) = start_orchestrator(
        test_config(),
        WorkflowCatalog::builtin(),
        ScriptedHandler::blocking(),
        vec![],
    )
    .await;
    assert!(orchestrator.start(token).is_err());
    orchestrator.shutdown(Duration::from_millis(10)).await;
}

// =============================================================================
// Placement under scoring strategies
// =============================================================================

async fn submit_on_tight_node(strategy: mediaflow::config::BalancingStrategy) {
    let handler = ScriptedHandler::fail_first(1);
    let config = test_config().with_strategy(strategy);
    let catalog = chain_catalog(RetryPolicy::none());
    // Room for exactly one small job.
    let (orchestrator, _token) = start_orchestrator(
        config,
        catalog,
        handler.clone(),
        vec![test_harness::sized_node("a", 1_000, 768)],
    )
    .await;

    let job_id = orchestrator
        .submit(small_request())
        .await
        .unwrap_or_else(|e| panic!("{strategy} rejected a job that fits: {e}"));
    assert_eq!(
        orchestrator.job(job_id).await.unwrap().node_id.as_deref(),
        Some("a")
    );

    // The first run fails; the retry must be placed again on the same node.
    wait_for_state(&orchestrator, job_id, JobState::Completed).await;
    assert_eq!(orchestrator.job(job_id).await.unwrap().retries, 1);
    assert!(orchestrator.pool().read().await.allocation(job_id).is_none());

    orchestrator.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_resource_fit_places_job_on_exactly_fitting_node() {
    submit_on_tight_node(mediaflow::config::BalancingStrategy::ResourceFit).await;
}

#[tokio::test]
async fn test_multi_factor_places_job_on_exactly_fitting_node() {
    submit_on_tight_node(mediaflow::config::BalancingStrategy::MultiFactor).await;
}

// =============================================================================
// Admission concurrency
// =============================================================================

/// Coordinator whose lock acquisition waits until the test opens the gate.
struct GatedCoordinator {
    inner: InMemoryCoordinator,
    gate: tokio::sync::Notify,
}

#[async_trait::async_trait]
impl CoordinationService for GatedCoordinator {
    async fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Option<mediaflow::services::DistributedLock> {
        self.gate.notified().await;
        self.inner.acquire_lock(key, owner, ttl).await
    }

    async fn release_lock(&self, key: &str, owner: &str) -> bool {
        self.inner.release_lock(key, owner).await
    }

    async fn save_snapshot(&self, snapshot: mediaflow::services::StateSnapshot) -> mediaflow::Result<()> {
        self.inner.save_snapshot(snapshot).await
    }

    async fn locks(&self) -> Vec<mediaflow::services::DistributedLock> {
        self.inner.locks().await
    }
}

#[tokio::test]
async fn test_queries_proceed_while_submission_waits_on_lock() {
    let coordinator = Arc::new(GatedCoordinator {
        inner: InMemoryCoordinator::new(),
        gate: tokio::sync::Notify::new(),
    });
    let orchestrator = Orchestrator::builder(test_config())
        .with_executor(StepExecutor::uniform(ScriptedHandler::blocking()))
        .with_coordinator(coordinator.clone())
        .build()
        .unwrap();
    orchestrator.register_node(node("a")).await.unwrap();
    orchestrator.start(tokio_util::sync::CancellationToken::new()).unwrap();

    let submitter = orchestrator.clone();
    let pending = tokio::spawn(async move { submitter.submit(small_request()).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let active = tokio::time::timeout(Duration::from_millis(200), orchestrator.active_jobs())
        .await
        .expect("job table must stay readable during lock acquisition");
    assert_eq!(active, 0);
    assert!(!pending.is_finished());

    coordinator.gate.notify_one();
    let job_id = pending.await.unwrap().unwrap();
    assert_eq!(orchestrator.job_state(job_id).await, Some(JobState::Processing));

    orchestrator.shutdown(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_concurrent_submissions_respect_admission_limit() {
    let mut config = test_config();
    config.max_concurrent_jobs = 3;
    let (orchestrator, _token) = start_orchestrator(
        config,
        WorkflowCatalog::builtin(),
        ScriptedHandler::blocking(),
        vec![node("a"), node("b")],
    )
    .await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let o = orchestrator.clone();
        tasks.spawn(async move { o.submit(small_request()).await });
    }
    let mut accepted = 0;
    let mut closed = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => accepted += 1,
            Err(OrchestratorError::AdmissionClosed(_)) => closed += 1,
            Err(e) => panic!("unexpected rejection: {e}"),
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(closed, 5);
    assert_eq!(orchestrator.active_jobs().await, 3);

    orchestrator.shutdown(Duration::from_millis(50)).await;
}
