use crate::model::CommandEnvelope;
use crate::operator::{Operator, OperatorError};
use anyhow::anyhow;
use async_trait::async_trait;
use cineforge_common::model::JobEvent;
use cineforge_common::SafeDisplay;
use cineforge_service_base::events::subscriber::EventHandler;
use cineforge_service_base::events::EventEnvelope;
use std::sync::Arc;
use tracing::{debug, warn};

/// Consumes `JOB_COMPLETED` / `JOB_FAILED`. Every delivery is a resume;
/// duplicates are no-ops because the graph has no next step for them.
pub struct JobEventHandler {
    operator: Arc<Operator>,
}

impl JobEventHandler {
    pub fn new(operator: Arc<Operator>) -> Arc<Self> {
        Arc::new(Self { operator })
    }
}

#[async_trait]
impl EventHandler for JobEventHandler {
    async fn handle(&self, envelope: EventEnvelope) -> anyhow::Result<()> {
        let event: JobEvent = envelope.decode()?;
        debug!(
            job_id = %event.job_id,
            project_id = %event.project_id,
            event_type = %event.event_type,
            "job event received"
        );
        match self.operator.resume_on_job_event(&event.project_id).await {
            Ok(()) => Ok(()),
            // Another command holds the lock; let redelivery retry.
            Err(OperatorError::ProjectBusy(project_id)) => {
                Err(anyhow!("project {project_id} is busy"))
            }
            Err(other) => Err(anyhow!(other.to_safe_string())),
        }
    }
}

/// Consumes the commands topic.
pub struct CommandHandler {
    operator: Arc<Operator>,
}

impl CommandHandler {
    pub fn new(operator: Arc<Operator>) -> Arc<Self> {
        Arc::new(Self { operator })
    }
}

#[async_trait]
impl EventHandler for CommandHandler {
    async fn handle(&self, envelope: EventEnvelope) -> anyhow::Result<()> {
        let command = match CommandEnvelope::try_from(envelope.payload.clone()) {
            Ok(command) => command,
            Err(error) => {
                // Malformed commands are dropped, not redelivered.
                warn!(%error, "discarding unparseable command");
                return Ok(());
            }
        };
        match self.operator.handle_command(command).await {
            Ok(()) => Ok(()),
            Err(OperatorError::ProjectBusy(project_id)) => {
                Err(anyhow!("project {project_id} is busy"))
            }
            Err(other) => {
                // Command-level failures are user-visible outcomes, not
                // delivery failures; redelivering would repeat them.
                warn!(error = %other.to_safe_string(), "command failed");
                Ok(())
            }
        }
    }
}
