use crate::checkpoint::Checkpointer;
use crate::workflow::stages::{StageOutcome, StageRunner};
use crate::workflow::state::WorkflowState;
use crate::workflow::WorkflowError;
use cineforge_common::model::Interrupt;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How one graph invocation ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// The final stage advanced past the end of the graph.
    Completed,
    /// A stage parked the workflow on the given interrupt.
    Suspended(Interrupt),
    /// Nothing to do: the entry router found no next stage (e.g. the
    /// project is already complete). Duplicate resume deliveries end here.
    NoNextStep,
}

/// The graph interpreter: runs stage handlers one at a time, records every
/// transition in the checkpoint, and turns dispatcher suspensions and
/// exhausted retries into persisted interrupts. There is no hidden control
/// flow; everything that changes `state` happens here or in a stage body.
pub struct WorkflowGraph {
    runner: StageRunner,
    checkpointer: Arc<Checkpointer>,
}

impl WorkflowGraph {
    pub fn new(runner: StageRunner, checkpointer: Arc<Checkpointer>) -> Self {
        Self {
            runner,
            checkpointer,
        }
    }

    pub async fn run(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, WorkflowError> {
        loop {
            if cancel.is_cancelled() {
                return Err(WorkflowError::Aborted(state.project_id.clone()));
            }

            if let Some(interrupt) = &state.interrupt {
                if interrupt.interrupt_type.needs_operator() && !state.interrupt_resolved {
                    // Still waiting for RESOLVE_INTERVENTION.
                    return Ok(RunOutcome::Suspended(interrupt.clone()));
                }
                state.clear_interrupt();
            }

            let stage = match state.current_stage {
                Some(stage) => stage,
                None => match self.runner.entry_route(state).await? {
                    Some(stage) => {
                        debug!(project_id = %state.project_id, %stage, "entry router selected stage");
                        state.current_stage = Some(stage);
                        self.checkpointer.save(state).await?;
                        stage
                    }
                    None => return Ok(RunOutcome::NoNextStep),
                },
            };

            debug!(project_id = %state.project_id, %stage, "running stage");
            match self.runner.run_stage(stage, state).await {
                Ok(StageOutcome::Advance(next)) => {
                    state.current_stage = next;
                    self.checkpointer.save(state).await?;
                    if next.is_none() {
                        info!(project_id = %state.project_id, "workflow completed");
                        return Ok(RunOutcome::Completed);
                    }
                }
                Ok(StageOutcome::Suspend(interrupt)) => {
                    state.interrupt = Some(interrupt.clone());
                    state.interrupt_resolved = false;
                    self.checkpointer.save(state).await?;
                    return Ok(RunOutcome::Suspended(interrupt));
                }
                Err(WorkflowError::RetriesExhausted {
                    node_name,
                    unique_key,
                    job_id,
                    attempt,
                    error,
                }) => {
                    let interrupt = Interrupt::retry_exhausted(
                        state.project_id.clone(),
                        &node_name,
                        attempt.max(0) as u32,
                        error.clone(),
                        json!({
                            "failures": [{
                                "uniqueKey": unique_key,
                                "jobId": job_id,
                                "attempt": attempt,
                                "error": error,
                            }],
                        }),
                    );
                    state.record_error(&node_name, &error);
                    state.interrupt = Some(interrupt.clone());
                    state.interrupt_resolved = false;
                    self.checkpointer.save(state).await?;
                    return Ok(RunOutcome::Suspended(interrupt));
                }
                Err(WorkflowError::BatchRetriesExhausted { node_name, failures }) => {
                    let summary = failures
                        .iter()
                        .map(|failure| format!("{}: {}", failure.unique_key, failure.error))
                        .collect::<Vec<_>>()
                        .join("; ");
                    let max_attempt = failures
                        .iter()
                        .map(|failure| failure.attempt.max(0) as u32)
                        .max()
                        .unwrap_or(0);
                    let interrupt = Interrupt::retry_exhausted(
                        state.project_id.clone(),
                        &node_name,
                        max_attempt,
                        summary.clone(),
                        json!({ "failures": failures }),
                    );
                    state.record_error(&node_name, &summary);
                    state.interrupt = Some(interrupt.clone());
                    state.interrupt_resolved = false;
                    self.checkpointer.save(state).await?;
                    return Ok(RunOutcome::Suspended(interrupt));
                }
                Err(other) => return Err(other),
            }
        }
    }
}
