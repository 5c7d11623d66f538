use crate::workflow::stage::Stage;
use chrono::{DateTime, Utc};
use cineforge_common::model::{Interrupt, JobId, ProjectId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// One recorded stage-level failure, kept for operators and audits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageErrorRecord {
    pub node_name: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// The persisted state channel of one workflow run. This is exactly what a
/// checkpoint row stores; everything the graph needs to resume must be in
/// here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub project_id: ProjectId,
    pub current_stage: Option<Stage>,
    /// Per-stage execution counters, keyed by stage name.
    #[serde(default)]
    pub node_attempts: HashMap<String, u32>,
    /// Every job this workflow has created, in creation order.
    #[serde(default)]
    pub job_ids: Vec<JobId>,
    #[serde(default)]
    pub errors: Vec<StageErrorRecord>,
    /// At most one pending interrupt at a time.
    #[serde(default)]
    pub interrupt: Option<Interrupt>,
    #[serde(default)]
    pub interrupt_resolved: bool,
    /// Logical units (unique keys) the operator chose to skip.
    #[serde(default)]
    pub skipped_nodes: BTreeSet<String>,
    /// Logical units granted a fresh job row after retry exhaustion.
    #[serde(default)]
    pub retry_nodes: BTreeSet<String>,
    /// Operator-revised parameters, merged into the payload of jobs created
    /// for `retry_nodes`.
    #[serde(default)]
    pub revised_params: Option<Value>,
}

impl WorkflowState {
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            current_stage: None,
            node_attempts: HashMap::new(),
            job_ids: Vec::new(),
            errors: Vec::new(),
            interrupt: None,
            interrupt_resolved: false,
            skipped_nodes: BTreeSet::new(),
            retry_nodes: BTreeSet::new(),
            revised_params: None,
        }
    }

    /// Bumps and returns the attempt counter of a node.
    pub fn next_node_attempt(&mut self, node_name: &str) -> u32 {
        let attempt = self.node_attempts.entry(node_name.to_string()).or_insert(0);
        *attempt += 1;
        *attempt
    }

    pub fn record_error(&mut self, node_name: &str, error: &str) {
        self.errors.push(StageErrorRecord {
            node_name: node_name.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn record_job(&mut self, job_id: JobId) {
        if !self.job_ids.contains(&job_id) {
            self.job_ids.push(job_id);
        }
    }

    pub fn clear_interrupt(&mut self) {
        self.interrupt = None;
        self.interrupt_resolved = false;
    }
}
