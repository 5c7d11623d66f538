use crate::model::{AssetKind, JobId, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a persisted job row.
///
/// `Completed`, `Fatal` and `Cancelled` are terminal; everything else can
/// still move. The transitions are owned by the job service, never written
/// ad hoc.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Running,
    Completed,
    Failed,
    Fatal,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Fatal | Self::Cancelled)
    }

    /// Active states are the ones guarded by the partial unique index on
    /// `(project_id, type, unique_key)`.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

/// Closed set of stage-handler tags. Workers resolve their handler from this
/// tag; adding a variant is a design change, not a configuration change.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    ExpandCreativePrompt,
    CreateScenesFromAudio,
    GenerateStoryboard,
    EnhanceStoryboard,
    SemanticAnalysis,
    GenerateCharacterAssets,
    GenerateLocationAssets,
    GenerateSceneFrames,
    GenerateSceneVideo,
    FrameRender,
    RenderVideo,
    Finalize,
}

/// The unit of scheduled work.
///
/// `attempt` doubles as the optimistic lock version: every mutation goes
/// through `WHERE attempt = expected` and bumps it by one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub project_id: ProjectId,
    pub job_type: JobType,
    pub state: JobState,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub unique_key: Option<String>,
    pub asset_key: Option<AssetKind>,
    pub attempt: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn retries_exhausted(&self) -> bool {
        self.attempt >= self.max_retries
    }
}

/// Why a job is being pushed back to `CREATED`. Only used for audit text on
/// the row and for metrics labels; the requeue behavior is identical.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RequeueContext {
    StaleRecovery,
    BackoffRetry,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn job_state_wire_format() {
        assert_eq!(JobState::Created.to_string(), "CREATED");
        assert_eq!("FATAL".parse::<JobState>().unwrap(), JobState::Fatal);
        assert!(JobState::Fatal.is_terminal());
        assert!(!JobState::Failed.is_terminal());
        assert!(JobState::Running.is_active());
        assert!(!JobState::Failed.is_active());
    }

    #[test]
    fn job_type_wire_format() {
        assert_eq!(
            JobType::ExpandCreativePrompt.to_string(),
            "EXPAND_CREATIVE_PROMPT"
        );
        assert_eq!(
            "GENERATE_SCENE_VIDEO".parse::<JobType>().unwrap(),
            JobType::GenerateSceneVideo
        );
    }
}
