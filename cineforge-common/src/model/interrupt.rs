use crate::model::ProjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InterruptType {
    WaitingForJob,
    WaitingForBatch,
    LlmRetryExhausted,
    LlmIntervention,
}

impl InterruptType {
    /// Whether the workflow resumes on its own (job events) or waits for an
    /// operator decision.
    pub fn needs_operator(&self) -> bool {
        matches!(self, Self::LlmRetryExhausted | Self::LlmIntervention)
    }
}

/// Suspension descriptor written into the checkpoint when a stage yields.
/// At most one interrupt is active per project checkpoint at a time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    #[serde(rename = "type")]
    pub interrupt_type: InterruptType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub error_details: Value,
    pub function_name: String,
    pub node_name: String,
    pub project_id: ProjectId,
    pub attempt: u32,
    pub last_attempt_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Interrupt {
    pub fn waiting_for_job(project_id: ProjectId, node_name: &str, attempt: u32) -> Self {
        Self {
            interrupt_type: InterruptType::WaitingForJob,
            error: None,
            error_details: Value::Null,
            function_name: "ensure_job".to_string(),
            node_name: node_name.to_string(),
            project_id,
            attempt,
            last_attempt_timestamp: Utc::now(),
            params: None,
        }
    }

    pub fn waiting_for_batch(
        project_id: ProjectId,
        node_name: &str,
        attempt: u32,
        remaining: usize,
    ) -> Self {
        Self {
            interrupt_type: InterruptType::WaitingForBatch,
            error: None,
            error_details: serde_json::json!({ "remaining": remaining }),
            function_name: "ensure_batch_jobs".to_string(),
            node_name: node_name.to_string(),
            project_id,
            attempt,
            last_attempt_timestamp: Utc::now(),
            params: None,
        }
    }

    pub fn retry_exhausted(
        project_id: ProjectId,
        node_name: &str,
        attempt: u32,
        error: String,
        error_details: Value,
    ) -> Self {
        Self {
            interrupt_type: InterruptType::LlmRetryExhausted,
            error: Some(error),
            error_details,
            function_name: "ensure_job".to_string(),
            node_name: node_name.to_string(),
            project_id,
            attempt,
            last_attempt_timestamp: Utc::now(),
            params: None,
        }
    }
}
