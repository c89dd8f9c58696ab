mod test_harness;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use mediaflow::error::OrchestratorError;
use mediaflow::events::{EventBus, WorkflowEvent};
use mediaflow::job::{ElementKind, JobAnalyzer, JobRequest, OutputFormat, WorkflowKind};
use mediaflow::worker::{StepExecutor, StepHandler};
use mediaflow::workflow::{
    Backoff, RetryPolicy, StepKind, WorkflowCatalog, WorkflowRunner, WorkflowStep,
    WorkflowTemplate, FALLBACK_WORKFLOW,
};
use test_harness::{
    chain_template, drain, medium_request, small_request, workflow_context, ScriptedHandler,
};

fn runner(handler: Arc<ScriptedHandler>, events: &EventBus) -> WorkflowRunner {
    let handler: Arc<dyn StepHandler> = handler;
    WorkflowRunner::new(Arc::new(StepExecutor::uniform(handler)), events.clone())
}

fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Backoff::Fixed, 1, 10)
}

#[tokio::test]
async fn test_parallel_steps_wait_for_dependencies() {
    let handler = ScriptedHandler::succeed(Duration::from_millis(10));
    let events = EventBus::new();
    let catalog = WorkflowCatalog::builtin();
    let template = catalog.get("balanced-async").unwrap();

    let run = runner(handler.clone(), &events)
        .execute(&template, workflow_context(medium_request(), "n1"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.results.len(), template.steps.len());

    for step in &template.steps {
        let record = handler.record_for(&step.id).unwrap();
        for dep in &step.dependencies {
            let dep_record = handler.record_for(dep).unwrap();
            assert!(
                dep_record.finished.unwrap() <= record.started,
                "{} started before {} finished",
                step.id,
                dep
            );
        }
    }
}

#[tokio::test]
async fn test_independent_steps_run_concurrently() {
    let handler = ScriptedHandler::succeed(Duration::from_millis(80));
    let catalog = WorkflowCatalog::builtin();
    let template = catalog.get("distributed").unwrap();

    runner(handler.clone(), &EventBus::new())
        .execute(&template, workflow_context(medium_request(), "n1"), CancellationToken::new())
        .await
        .unwrap();

    let partitions: Vec<_> = ["process-1", "process-2", "process-3"]
        .iter()
        .map(|id| handler.record_for(id).unwrap())
        .collect();
    let last_start = partitions.iter().map(|r| r.started).max().unwrap();
    let first_finish = partitions.iter().filter_map(|r| r.finished).min().unwrap();
    assert!(last_start < first_finish, "partitions should overlap");
}

#[tokio::test]
async fn test_sequential_failure_stops_later_steps() {
    let handler = ScriptedHandler::fail_step("b");
    let events = EventBus::new();
    let mut rx = events.workflows().subscribe();
    let template = chain_template("chain", quick_retry(3));

    let err = runner(handler.clone(), &events)
        .execute(&template, workflow_context(small_request(), "n1"), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        OrchestratorError::StepFailed { step, attempts, .. } => {
            assert_eq!(step, "b");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(handler.calls_for("a"), 1);
    assert_eq!(handler.calls_for("b"), 3);
    assert_eq!(handler.calls_for("c"), 0);

    let seen = drain(&mut rx);
    let retries: Vec<bool> = seen
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::StepFailed { will_retry, .. } => Some(*will_retry),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![true, true, false]);
    assert!(matches!(seen.last(), Some(WorkflowEvent::Failed { .. })));
}

#[tokio::test]
async fn test_flaky_step_recovers_within_budget() {
    let handler = ScriptedHandler::fail_first(2);
    let template = WorkflowTemplate::new("flaky", false)
        .with_step(WorkflowStep::new("a", StepKind::Download, 1_000).with_retry(quick_retry(3)));

    let run = runner(handler.clone(), &EventBus::new())
        .execute(&template, workflow_context(small_request(), "n1"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.attempts.get("a"), Some(&3));
    assert_eq!(handler.calls(), 3);
}

#[tokio::test]
async fn test_backoff_delays_between_attempts() {
    let handler = ScriptedHandler::fail_first(2);
    let template = WorkflowTemplate::new("slow-retry", false).with_step(
        WorkflowStep::new("a", StepKind::Upload, 1_000)
            .with_retry(RetryPolicy::new(3, Backoff::Linear, 40, 1_000)),
    );

    let started = Instant::now();
    runner(handler, &EventBus::new())
        .execute(&template, workflow_context(small_request(), "n1"), CancellationToken::new())
        .await
        .unwrap();
    // Linear: 40ms after the first failure, 80ms after the second.
    assert!(started.elapsed() >= Duration::from_millis(120));
}

#[tokio::test]
async fn test_timed_out_attempt_counts_as_failure() {
    let handler = ScriptedHandler::succeed(Duration::from_millis(500));
    let template = WorkflowTemplate::new("slow", false).with_step(
        WorkflowStep::new("encode", StepKind::Encode, 20).with_retry(quick_retry(2)),
    );

    let err = runner(handler.clone(), &EventBus::new())
        .execute(&template, workflow_context(small_request(), "n1"), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        OrchestratorError::StepFailed { attempts, message, .. } => {
            assert_eq!(attempts, 2);
            assert!(message.contains("timed out"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn test_cancellation_stops_the_run() {
    let handler = ScriptedHandler::blocking();
    let catalog = WorkflowCatalog::builtin();
    let template = catalog.get("balanced-async").unwrap();
    let token = CancellationToken::new();

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        runner(handler.clone(), &EventBus::new()).execute(
            &template,
            workflow_context(medium_request(), "n1"),
            token,
        ),
    )
    .await
    .expect("cancelled run must return promptly");

    assert!(matches!(result, Err(OrchestratorError::Cancelled)));
    // Only the root step was ever started.
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_run_publishes_step_and_workflow_events() {
    let handler = ScriptedHandler::succeed(Duration::from_millis(1));
    let events = EventBus::new();
    let mut rx = events.workflows().subscribe();
    let template = chain_template("chain", quick_retry(1));
    let ctx = workflow_context(small_request(), "n1");
    let execution_id = ctx.execution_id;

    runner(handler, &events)
        .execute(&template, ctx, CancellationToken::new())
        .await
        .unwrap();

    let seen = drain(&mut rx);
    assert_eq!(seen.len(), 5);
    assert!(matches!(&seen[0], WorkflowEvent::Started { workflow, .. } if workflow == "chain"));
    let completed: Vec<&str> = seen
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::StepCompleted { step_id, .. } => Some(step_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec!["a", "b", "c"]);
    assert!(matches!(
        seen.last(),
        Some(WorkflowEvent::Completed { execution_id: id, .. }) if *id == execution_id
    ));
}

#[test]
fn test_catalog_falls_back_to_balanced_template() {
    let mut catalog = WorkflowCatalog::new();
    let builtin = WorkflowCatalog::builtin();
    catalog
        .register(builtin.get(FALLBACK_WORKFLOW).unwrap().as_ref().clone())
        .unwrap();

    let video = JobRequest::new(OutputFormat::Mp4, 1280, 720).with_elements(ElementKind::Video, 1);
    let analysis = JobAnalyzer::new().analyze(&video);
    assert_eq!(analysis.recommended_workflow, WorkflowKind::HighPerformance);
    assert_eq!(catalog.select_workflow(&analysis).unwrap().name, FALLBACK_WORKFLOW);

    let empty = WorkflowCatalog::new();
    assert!(matches!(
        empty.select_workflow(&analysis),
        Err(OrchestratorError::UnknownWorkflow(_))
    ));
}

#[test]
fn test_invalid_templates_are_rejected() {
    let cyclic = WorkflowTemplate::new("cyclic", true)
        .with_step(WorkflowStep::new("a", StepKind::Process, 100).after(["b"]))
        .with_step(WorkflowStep::new("b", StepKind::Process, 100).after(["a"]));
    assert!(matches!(
        cyclic.validate(),
        Err(OrchestratorError::InvalidTemplate { .. })
    ));

    let dangling = WorkflowTemplate::new("dangling", true)
        .with_step(WorkflowStep::new("a", StepKind::Process, 100).after(["ghost"]));
    assert!(dangling.validate().is_err());

    let mut catalog = WorkflowCatalog::builtin();
    let before = catalog.len();
    assert!(catalog.register(cyclic).is_err());
    assert_eq!(catalog.len(), before);
}

#[test]
fn test_templates_load_from_file_over_builtins() {
    let custom = chain_template("fast-sync", quick_retry(1));
    let extra = chain_template("thumbnail", quick_retry(2));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("templates.json");
    std::fs::write(&path, serde_json::to_string(&vec![custom.clone(), extra]).unwrap()).unwrap();

    let catalog = WorkflowCatalog::from_file(&path).unwrap();
    assert_eq!(catalog.len(), WorkflowCatalog::builtin().len() + 1);
    assert!(catalog.contains("thumbnail"));
    assert_eq!(catalog.get("fast-sync").unwrap().as_ref(), &custom);

    std::fs::write(&path, "not json").unwrap();
    assert!(matches!(
        WorkflowCatalog::from_file(&path),
        Err(OrchestratorError::Json(_))
    ));
}

#[tokio::test]
async fn test_graph_failure_skips_dependents_and_cancels_siblings() {
    let steps = ScriptedHandler::fail_step("b");
    let uploads = ScriptedHandler::blocking();
    let executor = StepExecutor::new()
        .with_handler(StepKind::Upload, uploads.clone())
        .with_fallback(steps.clone());
    let runner = WorkflowRunner::new(Arc::new(executor), EventBus::new());
    let template = WorkflowTemplate::new("fan-out", true)
        .with_step(WorkflowStep::new("a", StepKind::Analyze, 1_000))
        .with_step(
            WorkflowStep::new("b", StepKind::Process, 1_000)
                .after(["a"])
                .with_retry(quick_retry(2)),
        )
        .with_step(WorkflowStep::new("c", StepKind::Encode, 1_000).after(["b"]))
        .with_step(WorkflowStep::new("d", StepKind::Upload, 60_000).after(["a"]));

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        runner.execute(&template, workflow_context(small_request(), "n1"), CancellationToken::new()),
    )
    .await
    .expect("a failed step must end the run without waiting on siblings");

    match result {
        Err(OrchestratorError::StepFailed { step, attempts, .. }) => {
            assert_eq!(step, "b");
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(steps.calls_for("c"), 0);
    // The independent sibling was started and then cancelled mid-attempt.
    let sibling = uploads.records();
    assert_eq!(sibling.len(), 1);
    assert_eq!(sibling[0].step_id, "d");
    assert!(sibling[0].finished.is_none());
}
