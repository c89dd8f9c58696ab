use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};

use crate::worker::executor::{StepContext, StepError, StepHandler};
use crate::workflow::StepKind;

/// Stand-in for the real media pipeline: sleeps a kind-dependent time and
/// fails at a configurable rate.
#[derive(Debug, Clone)]
pub struct SimulatedStepHandler {
    base_delay: Duration,
    failure_rate: f64,
}

impl SimulatedStepHandler {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            failure_rate: 0.0,
        }
    }

    /// Probability in `0.0..=1.0` that an attempt fails.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn weight(kind: StepKind) -> u32 {
        match kind {
            StepKind::Analyze | StepKind::Notify | StepKind::Cleanup => 1,
            StepKind::Download | StepKind::Upload => 2,
            StepKind::Process => 4,
            StepKind::Encode => 3,
        }
    }
}

#[async_trait]
impl StepHandler for SimulatedStepHandler {
    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        tokio::time::sleep(self.base_delay * Self::weight(ctx.kind)).await;

        let fail = self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate);
        if fail {
            return Err(StepError::failed(format!(
                "simulated {} failure on {}",
                ctx.kind, ctx.node_id
            )));
        }

        let output = match ctx.kind {
            StepKind::Upload => json!({
                "url": format!("https://media.invalid/{}/{}.{}", ctx.job_id, ctx.step_id, ctx.request.output_format),
            }),
            StepKind::Analyze => json!({
                "elements": ctx.request.elements.len(),
                "complexity": ctx.analysis.complexity,
            }),
            _ => json!({
                "step": ctx.step_id,
                "node": ctx.node_id,
                "inputs": ctx.results.len(),
            }),
        };
        Ok(output)
    }
}
