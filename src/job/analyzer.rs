use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::request::{ElementKind, JobRequest, OutputFormat};
use crate::resources::ResourceRequirements;

const BASE_COST_MS: u64 = 3_000;
const FAST_SYNC_LIMIT_MS: u64 = 30_000;
const ELEMENTS_PER_CHUNK: usize = 4;

const BASE_MEMORY_MB: u64 = 512;
const MEMORY_PER_ELEMENT_MB: u64 = 256;
const STORAGE_PER_ELEMENT_MB: u64 = 100;
const BANDWIDTH_PER_ELEMENT_MBPS: u64 = 10;
const CPU_PER_ELEMENT_MILLIS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
    Extreme,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Low => write!(f, "low"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::High => write!(f, "high"),
            Complexity::Extreme => write!(f, "extreme"),
        }
    }
}

/// Workflow template families the analyzer can recommend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    FastSync,
    BalancedAsync,
    HighPerformance,
    Distributed,
}

impl WorkflowKind {
    /// Name of the catalog template implementing this kind.
    pub fn template_name(&self) -> &'static str {
        match self {
            WorkflowKind::FastSync => "fast-sync",
            WorkflowKind::BalancedAsync => "balanced-async",
            WorkflowKind::HighPerformance => "high-performance",
            WorkflowKind::Distributed => "distributed",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.template_name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAnalysis {
    pub estimated_duration_ms: u64,
    pub requirements: ResourceRequirements,
    pub complexity: Complexity,
    pub recommended_workflow: WorkflowKind,
    pub parallelizable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
}

/// Classifies jobs and estimates their cost. Pure: identical requests
/// always produce identical analyses.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobAnalyzer;

impl JobAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, request: &JobRequest) -> JobAnalysis {
        let count = request.elements.len();
        let has_video = request.has_video();

        let complexity = Self::complexity(count, has_video);
        let requirements = Self::requirements(count, has_video);
        let estimated_duration_ms = Self::estimate_duration_ms(request);
        let recommended_workflow =
            Self::recommend(estimated_duration_ms, complexity, &requirements);

        JobAnalysis {
            estimated_duration_ms,
            requirements,
            complexity,
            recommended_workflow,
            parallelizable: count > 3 || has_video,
            chunk_count: (complexity == Complexity::Extreme)
                .then(|| count.div_ceil(ELEMENTS_PER_CHUNK)),
        }
    }

    fn complexity(count: usize, has_video: bool) -> Complexity {
        if count <= 2 && !has_video {
            Complexity::Low
        } else if count <= 5 {
            Complexity::Medium
        } else if count <= 10 {
            Complexity::High
        } else {
            Complexity::Extreme
        }
    }

    fn requirements(count: usize, has_video: bool) -> ResourceRequirements {
        let count = count as u64;
        let cpu_factor = if has_video { 2 } else { 1 };
        ResourceRequirements {
            cpu_millis: count * CPU_PER_ELEMENT_MILLIS * cpu_factor,
            memory_mb: BASE_MEMORY_MB + count * MEMORY_PER_ELEMENT_MB,
            storage_mb: count * STORAGE_PER_ELEMENT_MB,
            bandwidth_mbps: count * BANDWIDTH_PER_ELEMENT_MBPS,
            gpu_units: u64::from(has_video),
        }
    }

    fn estimate_duration_ms(request: &JobRequest) -> u64 {
        let elements: u64 = request
            .elements
            .iter()
            .map(|e| {
                let base = match e.kind {
                    ElementKind::Image => 2_000,
                    ElementKind::Text => 1_000,
                    ElementKind::Audio => 6_000,
                    ElementKind::Video => 15_000,
                };
                // Long clips cost half their runtime on top of the fixed cost.
                let clip = match (e.kind, e.duration_secs) {
                    (ElementKind::Video, Some(secs)) => (secs * 500.0) as u64,
                    _ => 0,
                };
                base + clip
            })
            .sum();

        let encode = match request.output_format {
            OutputFormat::Mp4 => 4_000,
            OutputFormat::Webm => 6_000,
            OutputFormat::Mov => 5_000,
            OutputFormat::Gif => 8_000,
        };

        let resolution = if request.height > 1080 {
            10_000
        } else if request.height > 720 {
            5_000
        } else {
            0
        };

        BASE_COST_MS + elements + encode + resolution
    }

    fn recommend(
        duration_ms: u64,
        complexity: Complexity,
        requirements: &ResourceRequirements,
    ) -> WorkflowKind {
        if duration_ms <= FAST_SYNC_LIMIT_MS && complexity == Complexity::Low {
            WorkflowKind::FastSync
        } else if complexity == Complexity::Extreme {
            WorkflowKind::Distributed
        } else if requirements.gpu_units > 0 {
            WorkflowKind::HighPerformance
        } else {
            WorkflowKind::BalancedAsync
        }
    }
}
