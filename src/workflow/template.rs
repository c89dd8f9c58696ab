use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::resources::ResourceRequirements;

/// The downstream unit of work a step invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Analyze,
    Download,
    Process,
    Encode,
    Upload,
    Notify,
    Cleanup,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Analyze => "analyze",
            StepKind::Download => "download",
            StepKind::Process => "process",
            StepKind::Encode => "encode",
            StepKind::Upload => "upload",
            StepKind::Notify => "notify",
            StepKind::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff,
            initial_delay_ms,
            max_delay_ms,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Backoff::Fixed, 0, 0)
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.backoff {
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.initial_delay_ms.saturating_mul(factor)
            }
            Backoff::Linear => self.initial_delay_ms.saturating_mul(u64::from(attempt)),
            Backoff::Fixed => self.initial_delay_ms,
        };
        Duration::from_millis(raw.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub kind: StepKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_hint: Option<ResourceRequirements>,
    #[serde(default)]
    pub parallelizable: bool,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, kind: StepKind, timeout_ms: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            dependencies: Vec::new(),
            timeout_ms,
            retry: RetryPolicy::default(),
            resource_hint: None,
            parallelizable: false,
        }
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_resource_hint(mut self, hint: ResourceRequirements) -> Self {
        self.resource_hint = Some(hint);
        self
    }

    pub fn parallelizable(mut self) -> Self {
        self.parallelizable = true;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A named, static step graph. `parallel` templates run every step whose
/// dependencies are complete concurrently; others run in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parallel: bool,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowTemplate {
    pub fn new(name: impl Into<String>, parallel: bool) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parallel,
            steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Check the step graph: at least one step, unique ids, known
    /// dependencies, no cycles, positive timeouts and attempt counts.
    /// Sequential templates must also list dependencies before dependents.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| OrchestratorError::InvalidTemplate {
            template: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(invalid("template has no steps".into()));
        }

        let mut position: HashMap<&str, usize> = HashMap::new();
        for (idx, step) in self.steps.iter().enumerate() {
            if position.insert(step.id.as_str(), idx).is_some() {
                return Err(invalid(format!("duplicate step id '{}'", step.id)));
            }
            if step.timeout_ms == 0 {
                return Err(invalid(format!("step '{}' has a zero timeout", step.id)));
            }
            if step.retry.max_attempts == 0 {
                return Err(invalid(format!("step '{}' allows zero attempts", step.id)));
            }
        }

        for (idx, step) in self.steps.iter().enumerate() {
            for dep in &step.dependencies {
                match position.get(dep.as_str()) {
                    None => {
                        return Err(invalid(format!(
                            "step '{}' depends on unknown step '{}'",
                            step.id, dep
                        )))
                    }
                    Some(&dep_idx) if !self.parallel && dep_idx >= idx => {
                        return Err(invalid(format!(
                            "step '{}' runs before its dependency '{}'",
                            step.id, dep
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        if self.topological_order().len() != self.steps.len() {
            return Err(invalid("dependency cycle detected".into()));
        }
        Ok(())
    }

    /// Kahn's ordering of step ids; shorter than `steps` when the graph has
    /// a cycle.
    pub fn topological_order(&self) -> Vec<&str> {
        let mut indegree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), 0))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            let unique: HashSet<&str> = step.dependencies.iter().map(String::as_str).collect();
            for dep in unique {
                if !indegree.contains_key(dep) {
                    continue;
                }
                if let Some(d) = indegree.get_mut(step.id.as_str()) {
                    *d += 1;
                }
                dependents.entry(dep).or_default().push(step.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = self
            .steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| indegree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &next in dependents.get(id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }
        order
    }
}
