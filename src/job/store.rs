use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::job::lifecycle::{Job, JobState, JobSummary};

/// The orchestrator's table of tracked jobs.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: HashMap<Uuid, Job>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new job. Returns false if the id is already tracked.
    pub fn insert(&mut self, job: Job) -> bool {
        if self.jobs.contains_key(&job.id) {
            return false;
        }
        self.jobs.insert(job.id, job);
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn state(&self, id: &Uuid) -> Option<JobState> {
        self.jobs.get(id).map(|j| j.state)
    }

    /// Jobs that have not reached a terminal state.
    pub fn active(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values().filter(|j| !j.is_terminal())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    /// Non-terminal jobs currently placed on `node_id`, oldest first.
    pub fn active_on_node(&self, node_id: &str) -> Vec<Uuid> {
        let mut jobs: Vec<&Job> = self
            .active()
            .filter(|j| j.node_id.as_deref() == Some(node_id))
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.into_iter().map(|j| j.id).collect()
    }

    /// Per-node count of active jobs.
    pub fn load_by_node(&self) -> HashMap<String, usize> {
        let mut load = HashMap::new();
        for job in self.active() {
            if let Some(node_id) = &job.node_id {
                *load.entry(node_id.clone()).or_insert(0) += 1;
            }
        }
        load
    }

    /// All jobs sorted by creation time.
    pub fn summaries(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.into_iter().map(JobSummary::from).collect()
    }

    /// Drop terminal jobs that finished more than `retention` ago.
    /// Returns the number of jobs removed.
    pub fn purge_terminal(&mut self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            !(job.is_terminal() && job.finished_at.is_some_and(|t| t <= cutoff))
        });
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
