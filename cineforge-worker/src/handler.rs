use crate::clients::{GenerativeModelClient, MediaStore, ModelError};
use async_trait::async_trait;
use cineforge_common::model::{AssetKind, AssetMetadata, AssetScope, Job};
use cineforge_service_base::repo::project::ProjectRepo;
use cineforge_service_base::service::asset::NewAssetVersion;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying later; the monitor owns the schedule.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Rejected by a safety layer; the worker sanitizes and retries a
    /// bounded number of times before giving up.
    #[error("safety rejection: {0}")]
    Safety(String),
    /// The job payload is broken; no retry can fix it.
    #[error("validation failure: {0}")]
    Validation(String),
}

impl From<ModelError> for HandlerError {
    fn from(error: ModelError) -> Self {
        match error {
            ModelError::Transient(message) => Self::Transient(message),
            ModelError::Safety(message) => Self::Safety(message),
            ModelError::Invalid(message) => Self::Validation(message),
        }
    }
}

/// One asset append a handler wants persisted. The worker service applies
/// these under the project lock after the handler returns.
#[derive(Debug)]
pub struct AssetWrite {
    pub scope: AssetScope,
    pub kind: AssetKind,
    pub versions: Vec<NewAssetVersion>,
    pub set_as_best: bool,
}

#[derive(Debug)]
pub struct HandlerOutput {
    pub assets: Vec<AssetWrite>,
    /// Stored on the job row and handed to the stage on resume.
    pub result: Value,
}

impl HandlerOutput {
    pub fn new(result: Value) -> Self {
        Self {
            assets: Vec::new(),
            result,
        }
    }

    pub fn with_asset(mut self, write: AssetWrite) -> Self {
        self.assets.push(write);
        self
    }
}

/// Shared collaborators handed to every handler invocation.
pub struct HandlerContext {
    pub model_client: Arc<dyn GenerativeModelClient>,
    pub media_store: Arc<dyn MediaStore>,
    pub project_repo: Arc<dyn ProjectRepo>,
    pub cancel: CancellationToken,
}

/// A stage-specific job executor. Handlers are pure with respect to the
/// database: they read through the repo, call collaborators, and describe
/// their asset writes; the worker service performs the writes and the
/// terminal job transition.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError>;
}

/// Metadata stamped on every asset version a job produces.
pub fn job_metadata(job: &Job, model: Option<String>) -> AssetMetadata {
    AssetMetadata {
        model,
        attempts: job.attempt.max(0) as u32,
        accepted_attempt: Some(job.attempt.max(0) as u32),
        evaluation: None,
        job_id: Some(job.id),
    }
}

/// Reads a required string field out of a job payload.
pub fn required_str(payload: &Value, key: &str) -> Result<String, HandlerError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HandlerError::Validation(format!("payload is missing `{key}`")))
}

pub fn optional_str(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}
