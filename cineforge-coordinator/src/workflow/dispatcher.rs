use crate::workflow::state::WorkflowState;
use crate::workflow::WorkflowError;
use cineforge_common::model::{
    AssetKind, Interrupt, Job, JobId, JobState, JobType, RequeueContext,
};
use cineforge_service_base::service::job::{CreateJob, JobService, JobServiceError};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// What a stage wants to exist for one logical unit of work.
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub job_type: JobType,
    pub unique_key: String,
    pub asset_key: Option<AssetKind>,
    pub payload: Value,
    /// Ignore a COMPLETED row and insert a fresh one (regeneration).
    pub force_new: bool,
}

impl JobSpec {
    pub fn new(job_type: JobType, unique_key: &str, asset_key: Option<AssetKind>, payload: Value) -> Self {
        Self {
            job_type,
            unique_key: unique_key.to_string(),
            asset_key,
            payload,
            force_new: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force_new = true;
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobFailure {
    pub unique_key: String,
    pub job_id: JobId,
    pub attempt: i32,
    pub error: String,
}

#[derive(Debug)]
pub enum EnsureOutcome {
    /// The job completed; the stage continues with its result.
    Ready(Value),
    /// The workflow must suspend and wait. `created` tells the stage
    /// whether this call inserted a fresh job row (regeneration flags are
    /// cleared at that point, not at completion).
    Suspend { interrupt: Interrupt, created: bool },
}

#[derive(Debug)]
pub enum BatchOutcome {
    /// Every unit completed (or was skipped); results in spec order, with
    /// `null` standing in for skipped units.
    Ready(Vec<Value>),
    /// `created` lists the unique keys this call inserted fresh rows for.
    Suspend {
        interrupt: Interrupt,
        created: Vec<String>,
    },
}

/// The sole suspension primitive of the workflow. Stages delegate all real
/// work to a job through `ensure_job` / `ensure_batch_jobs` and are
/// otherwise pure functions of project state.
pub struct Dispatcher {
    job_service: Arc<dyn JobService>,
    max_parallel_jobs: usize,
}

impl Dispatcher {
    pub fn new(job_service: Arc<dyn JobService>, max_parallel_jobs: usize) -> Self {
        Self {
            job_service,
            max_parallel_jobs: max_parallel_jobs.max(1),
        }
    }

    /// Idempotent "make sure this unit of work happens" primitive; see the
    /// variants of [`EnsureOutcome`]. Terminally failed jobs surface as
    /// [`WorkflowError::RetriesExhausted`].
    pub async fn ensure_job(
        &self,
        state: &mut WorkflowState,
        node_name: &str,
        spec: JobSpec,
    ) -> Result<EnsureOutcome, WorkflowError> {
        if state.skipped_nodes.contains(&spec.unique_key) {
            debug!(unique_key = %spec.unique_key, "unit was skipped by the operator");
            return Ok(EnsureOutcome::Ready(Value::Null));
        }

        let force_new = spec.force_new || state.retry_nodes.contains(&spec.unique_key);
        let latest = self
            .job_service
            .get_latest_job(&state.project_id, spec.job_type, Some(&spec.unique_key))
            .await?;

        match latest {
            Some(job) if job.state == JobState::Completed && !force_new => {
                Ok(EnsureOutcome::Ready(job.result.unwrap_or(Value::Null)))
            }
            Some(job)
                if (job.state == JobState::Fatal
                    || (job.state == JobState::Failed && job.retries_exhausted()))
                    && !force_new =>
            {
                Err(WorkflowError::RetriesExhausted {
                    node_name: node_name.to_string(),
                    unique_key: spec.unique_key,
                    job_id: job.id,
                    attempt: job.attempt,
                    error: job.error.unwrap_or_else(|| "unknown failure".to_string()),
                })
            }
            Some(job) if job.state == JobState::Failed && !force_new => {
                // Still within budget: push it back to CREATED instead of
                // waiting for the monitor's backoff window.
                let _ = self
                    .job_service
                    .requeue_job(&job.id, job.attempt, RequeueContext::BackoffRetry)
                    .await?;
                Ok(self.suspend_one(state, node_name, false))
            }
            Some(job) if job.state.is_active() => Ok(self.suspend_one(state, node_name, false)),
            _ => {
                // Missing, cancelled, or deliberately superseded: create a
                // fresh row and wait for a worker.
                let created = self.create_job(state, &spec).await?.is_some();
                Ok(self.suspend_one(state, node_name, created))
            }
        }
    }

    /// Fan-out version of [`ensure_job`]: partitions the specs, starts at
    /// most `max_parallel_jobs - in_flight` new jobs, and only reports
    /// `Ready` when every unit is completed or skipped.
    pub async fn ensure_batch_jobs(
        &self,
        state: &mut WorkflowState,
        node_name: &str,
        specs: Vec<JobSpec>,
    ) -> Result<BatchOutcome, WorkflowError> {
        let mut completed: HashMap<String, Value> = HashMap::new();
        let mut failures: Vec<JobFailure> = Vec::new();
        let mut in_flight: usize = 0;
        let mut missing: Vec<&JobSpec> = Vec::new();
        let mut skipped: usize = 0;

        for spec in &specs {
            if state.skipped_nodes.contains(&spec.unique_key) {
                skipped += 1;
                continue;
            }
            let force_new = spec.force_new || state.retry_nodes.contains(&spec.unique_key);
            let latest = self
                .job_service
                .get_latest_job(&state.project_id, spec.job_type, Some(&spec.unique_key))
                .await?;
            match latest {
                Some(job) if job.state == JobState::Completed && !force_new => {
                    completed.insert(
                        spec.unique_key.clone(),
                        job.result.unwrap_or(Value::Null),
                    );
                }
                Some(job)
                    if (job.state == JobState::Fatal
                        || (job.state == JobState::Failed && job.retries_exhausted()))
                        && !force_new =>
                {
                    failures.push(JobFailure {
                        unique_key: spec.unique_key.clone(),
                        job_id: job.id,
                        attempt: job.attempt,
                        error: job.error.unwrap_or_else(|| "unknown failure".to_string()),
                    });
                }
                Some(job) if job.state == JobState::Failed && !force_new => {
                    // The monitor's backoff sweep owns this one.
                    in_flight += 1;
                }
                Some(job) if job.state.is_active() => {
                    in_flight += 1;
                }
                _ => missing.push(spec),
            }
        }

        if !failures.is_empty() {
            // Do not start new work while any unit needs the operator.
            return Err(WorkflowError::BatchRetriesExhausted {
                node_name: node_name.to_string(),
                failures,
            });
        }

        let slots = self.max_parallel_jobs.saturating_sub(in_flight);
        let mut created = Vec::new();
        for spec in missing.iter().take(slots) {
            if self.create_job(state, spec).await?.is_some() {
                created.push(spec.unique_key.clone());
            }
            in_flight += 1;
        }

        let done = completed.len() + skipped;
        if done == specs.len() {
            let results = specs
                .iter()
                .map(|spec| completed.remove(&spec.unique_key).unwrap_or(Value::Null))
                .collect();
            Ok(BatchOutcome::Ready(results))
        } else {
            let remaining = specs.len() - done;
            let attempt = state.next_node_attempt(node_name);
            Ok(BatchOutcome::Suspend {
                interrupt: Interrupt::waiting_for_batch(
                    state.project_id.clone(),
                    node_name,
                    attempt,
                    remaining,
                ),
                created,
            })
        }
    }

    fn suspend_one(
        &self,
        state: &mut WorkflowState,
        node_name: &str,
        created: bool,
    ) -> EnsureOutcome {
        let attempt = state.next_node_attempt(node_name);
        EnsureOutcome::Suspend {
            interrupt: Interrupt::waiting_for_job(state.project_id.clone(), node_name, attempt),
            created,
        }
    }

    async fn create_job(
        &self,
        state: &mut WorkflowState,
        spec: &JobSpec,
    ) -> Result<Option<Job>, WorkflowError> {
        let payload = merge_revised_params(spec.payload.clone(), state.revised_params.as_ref());
        let request = CreateJob {
            job_type: spec.job_type,
            project_id: state.project_id.clone(),
            payload,
            unique_key: Some(spec.unique_key.clone()),
            asset_key: spec.asset_key,
            max_retries: None,
        };
        match self.job_service.create_job(request).await {
            Ok(job) => {
                state.record_job(job.id);
                state.retry_nodes.remove(&spec.unique_key);
                info!(
                    project_id = %state.project_id,
                    job_id = %job.id,
                    unique_key = %spec.unique_key,
                    job_type = %spec.job_type,
                    "ensured new job"
                );
                Ok(Some(job))
            }
            // Lost the race against a concurrent create; the winner's job
            // is observed on the next read.
            Err(JobServiceError::AlreadyActive(_)) => Ok(None),
            Err(other) => Err(other.into()),
        }
    }
}

/// Shallow-merges operator-revised params over a job payload. Non-object
/// payloads are replaced outright.
fn merge_revised_params(payload: Value, revised: Option<&Value>) -> Value {
    match revised {
        None => payload,
        Some(revised) => match (payload, revised) {
            (Value::Object(mut base), Value::Object(overlay)) => {
                for (key, value) in overlay {
                    base.insert(key.clone(), value.clone());
                }
                Value::Object(base)
            }
            (_, revised) => revised.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overlays_object_params() {
        let merged = merge_revised_params(
            json!({"prompt": "a red cube", "seed": 7}),
            Some(&json!({"prompt": "a blue cube"})),
        );
        assert_eq!(merged, json!({"prompt": "a blue cube", "seed": 7}));
    }

    #[test]
    fn merge_without_revision_is_identity() {
        let merged = merge_revised_params(json!({"a": 1}), None);
        assert_eq!(merged, json!({"a": 1}));
    }
}
