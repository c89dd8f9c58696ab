use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{OrchestratorError, Result};
use crate::job::{JobAnalysis, WorkflowKind};
use crate::resources::ResourceRequirements;
use crate::workflow::template::{Backoff, RetryPolicy, StepKind, WorkflowStep, WorkflowTemplate};

/// Template used when the recommended one is not registered.
pub const FALLBACK_WORKFLOW: &str = "balanced-async";

/// Named workflow templates, fixed after startup.
#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    templates: BTreeMap<String, Arc<WorkflowTemplate>>,
}

impl WorkflowCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the four built-in templates.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for template in builtin_templates() {
            // Built-ins are covered by `builtin_templates_are_valid`.
            if let Err(e) = catalog.register(template) {
                tracing::error!(error = %e, "Built-in workflow template rejected");
            }
        }
        catalog
    }

    /// Load templates from a JSON array file on top of the built-ins.
    /// Templates with a built-in name replace it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let templates: Vec<WorkflowTemplate> = serde_json::from_str(&contents)?;
        let mut catalog = Self::builtin();
        for template in templates {
            catalog.register(template)?;
        }
        tracing::info!(path = %path.display(), templates = catalog.len(), "Workflow catalog loaded");
        Ok(catalog)
    }

    /// Validate and add a template, replacing any with the same name.
    pub fn register(&mut self, template: WorkflowTemplate) -> Result<()> {
        template.validate()?;
        tracing::debug!(
            workflow = %template.name,
            steps = template.steps.len(),
            parallel = template.parallel,
            "Workflow template registered"
        );
        self.templates
            .insert(template.name.clone(), Arc::new(template));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowTemplate>> {
        self.templates.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    pub fn templates(&self) -> impl Iterator<Item = &WorkflowTemplate> {
        self.templates.values().map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Template for the analysis' recommendation, or the balanced template
    /// when that one is missing. Only an empty catalog yields an error.
    pub fn select_workflow(&self, analysis: &JobAnalysis) -> Result<Arc<WorkflowTemplate>> {
        let wanted = analysis.recommended_workflow.template_name();
        if let Some(template) = self.get(wanted) {
            return Ok(template);
        }
        match self.get(FALLBACK_WORKFLOW) {
            Some(template) => {
                tracing::warn!(
                    requested = wanted,
                    fallback = FALLBACK_WORKFLOW,
                    "Workflow not registered, using fallback"
                );
                Ok(template)
            }
            None => Err(OrchestratorError::UnknownWorkflow(wanted.to_string())),
        }
    }
}

fn retry(max_attempts: u32, backoff: Backoff, initial_delay_ms: u64) -> RetryPolicy {
    RetryPolicy::new(max_attempts, backoff, initial_delay_ms, 10_000)
}

fn fast_sync() -> WorkflowTemplate {
    WorkflowTemplate::new(WorkflowKind::FastSync.template_name(), false)
        .with_description("Small jobs processed start to finish in one pass")
        .with_step(
            WorkflowStep::new("analyze", StepKind::Analyze, 5_000)
                .with_retry(retry(2, Backoff::Fixed, 200)),
        )
        .with_step(
            WorkflowStep::new("download", StepKind::Download, 30_000)
                .after(["analyze"])
                .with_retry(retry(3, Backoff::Exponential, 500)),
        )
        .with_step(
            WorkflowStep::new("process", StepKind::Process, 60_000)
                .after(["download"])
                .with_retry(retry(2, Backoff::Linear, 1_000)),
        )
        .with_step(
            WorkflowStep::new("upload", StepKind::Upload, 30_000)
                .after(["process"])
                .with_retry(retry(3, Backoff::Exponential, 500)),
        )
        .with_step(
            WorkflowStep::new("notify", StepKind::Notify, 5_000)
                .after(["upload"])
                .with_retry(retry(2, Backoff::Fixed, 200)),
        )
}

fn balanced_async() -> WorkflowTemplate {
    WorkflowTemplate::new(WorkflowKind::BalancedAsync.template_name(), true)
        .with_description("General purpose graph with a notify/cleanup fan-out")
        .with_step(
            WorkflowStep::new("analyze", StepKind::Analyze, 10_000)
                .with_retry(retry(2, Backoff::Fixed, 500)),
        )
        .with_step(
            WorkflowStep::new("download", StepKind::Download, 120_000)
                .after(["analyze"])
                .with_retry(retry(3, Backoff::Exponential, 1_000)),
        )
        .with_step(
            WorkflowStep::new("process", StepKind::Process, 300_000)
                .after(["download"])
                .with_retry(retry(2, Backoff::Linear, 2_000))
                .parallelizable(),
        )
        .with_step(
            WorkflowStep::new("upload", StepKind::Upload, 120_000)
                .after(["process"])
                .with_retry(retry(3, Backoff::Exponential, 1_000)),
        )
        .with_step(
            WorkflowStep::new("notify", StepKind::Notify, 10_000)
                .after(["upload"])
                .with_retry(retry(2, Backoff::Fixed, 500)),
        )
        .with_step(
            WorkflowStep::new("cleanup", StepKind::Cleanup, 30_000)
                .after(["upload"])
                .with_retry(retry(1, Backoff::Fixed, 0)),
        )
}

fn high_performance() -> WorkflowTemplate {
    let accelerated = ResourceRequirements::new(4_000, 4_096, 0, 0).with_gpu(1);
    WorkflowTemplate::new(WorkflowKind::HighPerformance.template_name(), true)
        .with_description("Accelerator-backed processing with encode and preview in parallel")
        .with_step(
            WorkflowStep::new("analyze", StepKind::Analyze, 10_000)
                .with_retry(retry(2, Backoff::Fixed, 500)),
        )
        .with_step(
            WorkflowStep::new("download", StepKind::Download, 120_000)
                .after(["analyze"])
                .with_retry(retry(3, Backoff::Exponential, 1_000)),
        )
        .with_step(
            WorkflowStep::new("process", StepKind::Process, 300_000)
                .after(["download"])
                .with_retry(retry(2, Backoff::Exponential, 2_000))
                .with_resource_hint(accelerated)
                .parallelizable(),
        )
        .with_step(
            WorkflowStep::new("encode", StepKind::Encode, 600_000)
                .after(["process"])
                .with_retry(retry(2, Backoff::Exponential, 2_000))
                .with_resource_hint(accelerated)
                .parallelizable(),
        )
        .with_step(
            WorkflowStep::new("preview", StepKind::Encode, 120_000)
                .after(["process"])
                .with_retry(retry(2, Backoff::Fixed, 1_000))
                .parallelizable(),
        )
        .with_step(
            WorkflowStep::new("upload", StepKind::Upload, 120_000)
                .after(["encode", "preview"])
                .with_retry(retry(3, Backoff::Exponential, 1_000)),
        )
        .with_step(
            WorkflowStep::new("notify", StepKind::Notify, 10_000)
                .after(["upload"])
                .with_retry(retry(2, Backoff::Fixed, 500)),
        )
}

fn distributed() -> WorkflowTemplate {
    let mut template = WorkflowTemplate::new(WorkflowKind::Distributed.template_name(), true)
        .with_description("Extreme jobs split into partitions processed side by side")
        .with_step(
            WorkflowStep::new("split", StepKind::Analyze, 30_000)
                .with_retry(retry(2, Backoff::Fixed, 500)),
        );
    let partitions: Vec<String> = (1..=3).map(|i| format!("process-{i}")).collect();
    for id in &partitions {
        template = template.with_step(
            WorkflowStep::new(id.clone(), StepKind::Process, 600_000)
                .after(["split"])
                .with_retry(retry(3, Backoff::Exponential, 2_000))
                .parallelizable(),
        );
    }
    template
        .with_step(
            WorkflowStep::new("merge", StepKind::Process, 300_000)
                .after(partitions)
                .with_retry(retry(2, Backoff::Linear, 2_000)),
        )
        .with_step(
            WorkflowStep::new("encode", StepKind::Encode, 900_000)
                .after(["merge"])
                .with_retry(retry(2, Backoff::Exponential, 2_000)),
        )
        .with_step(
            WorkflowStep::new("upload", StepKind::Upload, 300_000)
                .after(["encode"])
                .with_retry(retry(3, Backoff::Exponential, 1_000)),
        )
        .with_step(
            WorkflowStep::new("notify", StepKind::Notify, 10_000)
                .after(["upload"])
                .with_retry(retry(2, Backoff::Fixed, 500)),
        )
        .with_step(
            WorkflowStep::new("cleanup", StepKind::Cleanup, 60_000)
                .after(["upload"])
                .with_retry(retry(1, Backoff::Fixed, 0)),
        )
}

/// The templates every catalog starts from.
pub fn builtin_templates() -> Vec<WorkflowTemplate> {
    vec![fast_sync(), balanced_async(), high_performance(), distributed()]
}
