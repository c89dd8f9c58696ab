//! In-process event bus.
//!
//! Each event category has its own [`Topic`]. A topic keeps one unbounded
//! queue per subscriber and publishing clones the event into every live
//! queue, so a slow subscriber never causes another to miss events. Ordering
//! is preserved within a topic for a given subscriber; nothing is promised
//! across topics.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::resources::HealthStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Accepted {
        job_id: Uuid,
        workflow: String,
    },
    Started {
        job_id: Uuid,
        node_id: String,
    },
    Completed {
        job_id: Uuid,
    },
    Failed {
        job_id: Uuid,
        error: String,
    },
    Retrying {
        job_id: Uuid,
        attempt: u32,
        reason: String,
    },
    Reassigned {
        job_id: Uuid,
        from: String,
        to: String,
    },
    Cancelled {
        job_id: Uuid,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Accepted { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Completed { job_id }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Retrying { job_id, .. }
            | JobEvent::Reassigned { job_id, .. }
            | JobEvent::Cancelled { job_id } => *job_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Joined {
        node_id: String,
    },
    Left {
        node_id: String,
        orphaned_jobs: Vec<Uuid>,
    },
    StatusChanged {
        node_id: String,
        from: HealthStatus,
        to: HealthStatus,
    },
    Unhealthy {
        node_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceAlert {
    pub severity: AlertSeverity,
    /// Dimension that crossed the threshold (`cpu`, `memory`, ...).
    pub resource: String,
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    Alert(ResourceAlert),
    /// Utilization dropped back below the warning threshold after an alert.
    Recovered,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    Started {
        job_id: Uuid,
        execution_id: Uuid,
        workflow: String,
    },
    StepCompleted {
        job_id: Uuid,
        execution_id: Uuid,
        step_id: String,
        attempts: u32,
    },
    StepFailed {
        job_id: Uuid,
        execution_id: Uuid,
        step_id: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    Completed {
        job_id: Uuid,
        execution_id: Uuid,
        workflow: String,
    },
    Failed {
        job_id: Uuid,
        execution_id: Uuid,
        workflow: String,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitEvent {
    Opened { name: String, failures: u32 },
    Closed { name: String },
}

/// A single event category with explicit fan-out to its subscribers.
pub struct Topic<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> Topic<T> {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber. Returns the number reached.
    pub fn publish(&self, event: T) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        // The list stays valid even if a publisher panicked mid-send.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Default)]
struct Topics {
    jobs: Topic<JobEvent>,
    nodes: Topic<NodeEvent>,
    resources: Topic<ResourceEvent>,
    workflows: Topic<WorkflowEvent>,
    circuits: Topic<CircuitEvent>,
}

/// Cheaply cloneable handle to the shared topics.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<Topics>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> &Topic<JobEvent> {
        &self.topics.jobs
    }

    pub fn nodes(&self) -> &Topic<NodeEvent> {
        &self.topics.nodes
    }

    pub fn resources(&self) -> &Topic<ResourceEvent> {
        &self.topics.resources
    }

    pub fn workflows(&self) -> &Topic<WorkflowEvent> {
        &self.topics.workflows
    }

    pub fn circuits(&self) -> &Topic<CircuitEvent> {
        &self.topics.circuits
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}
