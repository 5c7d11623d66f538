use crate::events::{BusError, EventBus, EventEnvelope};
use crate::repo::job::{JobRecord, JobRepo, JobRowUpdate};
use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::Utc;
use cineforge_common::config::PipelineConfig;
use cineforge_common::model::{
    Job, JobEvent, JobEventType, JobId, JobState, JobType, ProjectId, RequeueContext,
    JOB_EVENTS_TOPIC,
};
use cineforge_common::SafeDisplay;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("A job for this logical address is already active: {0}")]
    AlreadyActive(String),
    #[error("Invalid job row: {0}")]
    InvalidRow(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error(transparent)]
    InternalBusError(#[from] BusError),
}

impl SafeDisplay for JobServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            Self::JobNotFound(_) => self.to_string(),
            Self::AlreadyActive(_) => self.to_string(),
            Self::InvalidRow(_) => self.to_string(),
            Self::InternalRepoError(inner) => inner.to_safe_string(),
            Self::InternalBusError(inner) => inner.to_safe_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateJob {
    pub job_type: JobType,
    pub project_id: ProjectId,
    pub payload: Value,
    pub unique_key: Option<String>,
    pub asset_key: Option<cineforge_common::model::AssetKind>,
    pub max_retries: Option<i32>,
}

/// Service-level patch for `update_job_safe`. There is intentionally no way
/// to express an `attempt` change.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub payload: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<Option<String>>,
}

/// Durable job store with atomic state transitions, per-project concurrency
/// limits and monotonic attempt versioning. Terminal and dispatch events are
/// published after the repo write that caused them.
#[async_trait]
pub trait JobService: Send + Sync {
    async fn create_job(&self, request: CreateJob) -> Result<Job, JobServiceError>;

    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, JobServiceError>;

    async fn get_latest_job(
        &self,
        project_id: &ProjectId,
        job_type: JobType,
        unique_key: Option<&str>,
    ) -> Result<Option<Job>, JobServiceError>;

    /// CREATED -> RUNNING; `None` when the job is gone, not claimable, or
    /// the project is at its RUNNING cap.
    async fn claim_job(&self, job_id: &JobId) -> Result<Option<Job>, JobServiceError>;

    /// Optimistic update; `None` is the normal concurrent-modification
    /// outcome.
    async fn update_job_safe(
        &self,
        job_id: &JobId,
        expected_attempt: i32,
        update: JobUpdate,
    ) -> Result<Option<Job>, JobServiceError>;

    /// Unconditional worker-side transition; FAILED bumps the attempt and
    /// becomes FATAL once the budget is exhausted.
    async fn update_job_state(
        &self,
        job_id: &JobId,
        state: JobState,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Option<Job>, JobServiceError>;

    /// Pushes a FAILED or stale RUNNING job back to CREATED, guarded by the
    /// expected attempt, and re-dispatches it.
    async fn requeue_job(
        &self,
        job_id: &JobId,
        expected_attempt: i32,
        context: RequeueContext,
    ) -> Result<Option<Job>, JobServiceError>;

    async fn cancel_job(&self, job_id: &JobId) -> Result<Option<Job>, JobServiceError>;

    async fn list_jobs(&self, project_id: &ProjectId) -> Result<Vec<Job>, JobServiceError>;
}

pub struct JobServiceDefault {
    job_repo: Arc<dyn JobRepo>,
    event_bus: Arc<dyn EventBus>,
    config: PipelineConfig,
}

impl JobServiceDefault {
    pub fn new(
        job_repo: Arc<dyn JobRepo>,
        event_bus: Arc<dyn EventBus>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            job_repo,
            event_bus,
            config,
        }
    }

    fn to_job(record: JobRecord) -> Result<Job, JobServiceError> {
        Job::try_from(record).map_err(JobServiceError::InvalidRow)
    }

    async fn publish_job_event(
        &self,
        event_type: JobEventType,
        job: &Job,
    ) -> Result<(), JobServiceError> {
        let event = JobEvent::new(event_type, job.id, job.project_id.clone());
        let envelope = EventEnvelope::try_from(&event)?;
        self.event_bus.publish(JOB_EVENTS_TOPIC, envelope).await?;
        Ok(())
    }
}

#[async_trait]
impl JobService for JobServiceDefault {
    async fn create_job(&self, request: CreateJob) -> Result<Job, JobServiceError> {
        let now = Utc::now();
        let record = JobRecord {
            id: uuid::Uuid::new_v4(),
            project_id: request.project_id.0.clone(),
            job_type: request.job_type.to_string(),
            state: JobState::Created.to_string(),
            payload: request.payload,
            result: None,
            error: None,
            unique_key: request.unique_key,
            asset_key: request.asset_key.map(|kind| kind.to_string()),
            attempt: 1,
            max_retries: request.max_retries.unwrap_or(self.config.max_retries),
            created_at: now,
            updated_at: now,
        };

        let inserted = match self.job_repo.insert(record).await {
            Ok(inserted) => inserted,
            Err(RepoError::UniqueViolation(detail)) => {
                return Err(JobServiceError::AlreadyActive(detail));
            }
            Err(other) => return Err(other.into()),
        };
        let job = Self::to_job(inserted)?;

        info!(
            job_id = %job.id,
            project_id = %job.project_id,
            job_type = %job.job_type,
            unique_key = ?job.unique_key,
            "created job"
        );
        self.publish_job_event(JobEventType::JobDispatched, &job).await?;
        Ok(job)
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, JobServiceError> {
        match self.job_repo.get(&job_id.0).await? {
            Some(record) => Ok(Some(Self::to_job(record)?)),
            None => Ok(None),
        }
    }

    async fn get_latest_job(
        &self,
        project_id: &ProjectId,
        job_type: JobType,
        unique_key: Option<&str>,
    ) -> Result<Option<Job>, JobServiceError> {
        match self
            .job_repo
            .get_latest(project_id.as_str(), &job_type.to_string(), unique_key)
            .await?
        {
            Some(record) => Ok(Some(Self::to_job(record)?)),
            None => Ok(None),
        }
    }

    async fn claim_job(&self, job_id: &JobId) -> Result<Option<Job>, JobServiceError> {
        let claimed = self
            .job_repo
            .claim(&job_id.0, self.config.max_concurrent_jobs_per_project)
            .await?;
        match claimed {
            Some(record) => {
                let job = Self::to_job(record)?;
                debug!(job_id = %job.id, project_id = %job.project_id, "claimed job");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn update_job_safe(
        &self,
        job_id: &JobId,
        expected_attempt: i32,
        update: JobUpdate,
    ) -> Result<Option<Job>, JobServiceError> {
        let row_update = JobRowUpdate {
            state: update.state.map(|state| state.to_string()),
            payload: update.payload,
            result: update.result,
            set_error: update.error,
            ..JobRowUpdate::default()
        };
        match self
            .job_repo
            .update_safe(&job_id.0, expected_attempt, row_update)
            .await?
        {
            Some(record) => Ok(Some(Self::to_job(record)?)),
            None => {
                debug!(
                    job_id = %job_id,
                    expected_attempt,
                    "optimistic update lost, row moved on"
                );
                Ok(None)
            }
        }
    }

    async fn update_job_state(
        &self,
        job_id: &JobId,
        state: JobState,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Option<Job>, JobServiceError> {
        let updated = self
            .job_repo
            .update_state(&job_id.0, &state.to_string(), result, error)
            .await?;
        let Some(record) = updated else {
            return Ok(None);
        };
        let job = Self::to_job(record)?;

        let event_type = match state {
            JobState::Completed => Some(JobEventType::JobCompleted),
            // FAILED and a straight-to-FATAL validation failure both
            // surface as JOB_FAILED; the graph decides what that means.
            JobState::Failed | JobState::Fatal => Some(JobEventType::JobFailed),
            JobState::Cancelled => Some(JobEventType::JobCancelled),
            _ => None,
        };
        if let Some(event_type) = event_type {
            self.publish_job_event(event_type, &job).await?;
        }
        info!(
            job_id = %job.id,
            project_id = %job.project_id,
            state = %job.state,
            attempt = job.attempt,
            "job state transition"
        );
        Ok(Some(job))
    }

    async fn requeue_job(
        &self,
        job_id: &JobId,
        expected_attempt: i32,
        context: RequeueContext,
    ) -> Result<Option<Job>, JobServiceError> {
        let audit = format!(
            "\n[{} requeue at {} from attempt {}]",
            context,
            Utc::now().to_rfc3339(),
            expected_attempt
        );
        // Stale recovery targets RUNNING rows, backoff retry FAILED rows;
        // anything that moved on since the select must be left alone.
        let guard_state = match context {
            RequeueContext::StaleRecovery => JobState::Running,
            RequeueContext::BackoffRetry => JobState::Failed,
        };
        let row_update = JobRowUpdate {
            state: Some(JobState::Created.to_string()),
            append_error: Some(audit),
            guard_state: Some(guard_state.to_string()),
            ..JobRowUpdate::default()
        };
        match self
            .job_repo
            .update_safe(&job_id.0, expected_attempt, row_update)
            .await?
        {
            Some(record) => {
                let job = Self::to_job(record)?;
                info!(
                    job_id = %job.id,
                    project_id = %job.project_id,
                    context = %context,
                    attempt = job.attempt,
                    "requeued job"
                );
                self.publish_job_event(JobEventType::JobDispatched, &job).await?;
                Ok(Some(job))
            }
            None => {
                warn!(
                    job_id = %job_id,
                    expected_attempt,
                    context = %context,
                    "requeue skipped, attempt changed under us"
                );
                Ok(None)
            }
        }
    }

    async fn cancel_job(&self, job_id: &JobId) -> Result<Option<Job>, JobServiceError> {
        match self.job_repo.cancel(&job_id.0).await? {
            Some(record) => {
                let job = Self::to_job(record)?;
                self.publish_job_event(JobEventType::JobCancelled, &job).await?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn list_jobs(&self, project_id: &ProjectId) -> Result<Vec<Job>, JobServiceError> {
        let records = self.job_repo.list_for_project(project_id.as_str()).await?;
        records.into_iter().map(Self::to_job).collect()
    }
}
