use crate::workflow::state::WorkflowState;
use crate::workflow::WorkflowError;
use chrono::Utc;
use cineforge_common::model::ProjectId;
use cineforge_service_base::repo::checkpoint::{CheckpointRecord, CheckpointRepo};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const CHECKPOINT_NS: &str = "";
const CHECKPOINT_TYPE: &str = "workflow_state";

/// Persists the workflow state channel after every stage transition and
/// restores it on resume. The project id is the thread id.
pub struct Checkpointer {
    checkpoint_repo: Arc<dyn CheckpointRepo>,
}

impl Checkpointer {
    pub fn new(checkpoint_repo: Arc<dyn CheckpointRepo>) -> Arc<Self> {
        Arc::new(Self { checkpoint_repo })
    }

    pub async fn save(&self, state: &WorkflowState) -> Result<(), WorkflowError> {
        let checkpoint = serde_json::to_value(state)
            .map_err(|e| WorkflowError::InvalidState(format!("unserializable state: {e}")))?;
        let record = CheckpointRecord {
            thread_id: state.project_id.as_str().to_string(),
            checkpoint_ns: CHECKPOINT_NS.to_string(),
            checkpoint_id: Uuid::new_v4(),
            checkpoint,
            checkpoint_type: CHECKPOINT_TYPE.to_string(),
            created_at: Utc::now(),
        };
        self.checkpoint_repo.save(record).await?;
        debug!(
            project_id = %state.project_id,
            stage = ?state.current_stage,
            "saved checkpoint"
        );
        Ok(())
    }

    pub async fn load_latest(
        &self,
        project_id: &ProjectId,
    ) -> Result<Option<WorkflowState>, WorkflowError> {
        let record = self
            .checkpoint_repo
            .latest(project_id.as_str(), CHECKPOINT_NS)
            .await?;
        match record {
            Some(record) => {
                let state: WorkflowState = serde_json::from_value(record.checkpoint)
                    .map_err(|e| {
                        WorkflowError::InvalidState(format!("corrupt checkpoint: {e}"))
                    })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}
