use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::ResilienceConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{CircuitEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// One trial run is allowed through.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Fails workflow runs fast after repeated failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerState>,
    events: EventBus,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        reset_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a run may start now. An open breaker whose reset timeout has
    /// elapsed lets exactly one trial through.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(true, |t| t.elapsed() >= self.reset_timeout);
                if elapsed {
                    tracing::info!(breaker = %self.name, "Circuit breaker half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            drop(inner);
            tracing::info!(breaker = %self.name, "Circuit breaker closed");
            self.events.circuits().publish(CircuitEvent::Closed {
                name: self.name.clone(),
            });
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_in_flight = false;
        let open = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            let failures = inner.consecutive_failures;
            drop(inner);
            tracing::warn!(breaker = %self.name, failures, "Circuit breaker opened");
            self.events.circuits().publish(CircuitEvent::Opened {
                name: self.name.clone(),
                failures,
            });
        }
    }

    /// A run that was cancelled says nothing about health; free the trial slot.
    pub fn record_cancelled(&self) {
        self.lock().trial_in_flight = false;
    }
}

/// Workflow-level retries on the same node, gated by a shared breaker.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    max_attempts: u32,
    retry_delay: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl ResiliencePolicy {
    pub fn new(config: &ResilienceConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            breaker,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `op` until it succeeds, the attempts run out, the breaker refuses
    /// or `cancel` fires. `op` receives the 1-based attempt number.
    pub async fn run<F, Fut, T>(&self, label: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            if !self.breaker.try_acquire() {
                return Err(OrchestratorError::WorkflowFailed {
                    workflow: label.to_string(),
                    message: "circuit breaker open".to_string(),
                });
            }

            match op(attempt).await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(OrchestratorError::Cancelled) => {
                    self.breaker.record_cancelled();
                    return Err(OrchestratorError::Cancelled);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if attempt < self.max_attempts {
                        tracing::warn!(
                            workflow = label,
                            attempt,
                            max_attempts = self.max_attempts,
                            error = %e,
                            "Workflow run failed, retrying"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                            _ = tokio::time::sleep(self.retry_delay) => {}
                        }
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| OrchestratorError::WorkflowFailed {
            workflow: label.to_string(),
            message: "no attempt was made".to_string(),
        }))
    }
}
