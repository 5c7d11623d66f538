pub mod dispatcher;
pub mod graph;
pub mod stage;
pub mod stages;
pub mod state;

use crate::workflow::dispatcher::JobFailure;
use cineforge_common::model::{JobId, ProjectId};
use cineforge_common::SafeDisplay;
use cineforge_service_base::events::BusError;
use cineforge_service_base::repo::RepoError;
use cineforge_service_base::service::asset::AssetError;
use cineforge_service_base::service::job::JobServiceError;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("retries exhausted for {node_name}/{unique_key}: {error}")]
    RetriesExhausted {
        node_name: String,
        unique_key: String,
        job_id: JobId,
        attempt: i32,
        error: String,
    },
    #[error("retries exhausted for {} unit(s) of {node_name}", failures.len())]
    BatchRetriesExhausted {
        node_name: String,
        failures: Vec<JobFailure>,
    },
    #[error("project not found: {0}")]
    ProjectNotFound(ProjectId),
    #[error("workflow aborted for {0}")]
    Aborted(ProjectId),
    #[error("invalid workflow state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    InternalJobError(#[from] JobServiceError),
    #[error(transparent)]
    InternalAssetError(#[from] AssetError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error(transparent)]
    InternalBusError(#[from] BusError),
}

impl SafeDisplay for WorkflowError {
    fn to_safe_string(&self) -> String {
        match self {
            Self::RetriesExhausted { .. } => self.to_string(),
            Self::BatchRetriesExhausted { .. } => self.to_string(),
            Self::ProjectNotFound(_) => self.to_string(),
            Self::Aborted(_) => self.to_string(),
            Self::InvalidState(_) => self.to_string(),
            Self::InternalJobError(inner) => inner.to_safe_string(),
            Self::InternalAssetError(inner) => inner.to_safe_string(),
            Self::InternalRepoError(inner) => inner.to_safe_string(),
            Self::InternalBusError(inner) => inner.to_safe_string(),
        }
    }
}
