use crate::model::{CommandId, JobId, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JOB_EVENTS_TOPIC: &str = "job-events";
pub const PIPELINE_EVENTS_TOPIC: &str = "pipeline-events";
pub const COMMANDS_TOPIC: &str = "commands";

/// Attribute key used for subscription filtering on every topic.
pub const EVENT_TYPE_ATTRIBUTE: &str = "type";

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
pub enum JobEventType {
    JobDispatched,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

/// Published on the job-events topic after the DB commit that caused the
/// transition. Delivery is at-least-once; consumers must be idempotent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub event_type: JobEventType,
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(event_type: JobEventType, job_id: JobId, project_id: ProjectId) -> Self {
        Self {
            event_type,
            job_id,
            project_id,
            timestamp: Utc::now(),
        }
    }
}

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
pub enum PipelineEventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    SceneSkipped,
    FullState,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    #[serde(rename = "type")]
    pub event_type: PipelineEventType,
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl PipelineEvent {
    pub fn new(
        event_type: PipelineEventType,
        project_id: ProjectId,
        command_id: Option<CommandId>,
        payload: Value,
    ) -> Self {
        Self {
            event_type,
            project_id,
            command_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn job_event_serializes_with_type_tag() {
        let event = JobEvent::new(
            JobEventType::JobCompleted,
            crate::model::JobId::new_random(),
            ProjectId::from("P1"),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "JOB_COMPLETED");
        assert_eq!(json["project_id"], "P1");
    }
}
