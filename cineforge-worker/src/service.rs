use crate::clients::sanitize_prompt;
use crate::config::ExecutionConfig;
use crate::handler::{AssetWrite, HandlerContext, HandlerError, HandlerOutput};
use crate::handlers::HandlerRegistry;
use crate::metrics::JOBS_PROCESSED;
use cineforge_common::config::LockConfig;
use cineforge_common::model::{Job, JobEvent, JobState, ProjectId};
use cineforge_common::SafeDisplay;
use cineforge_service_base::events::Subscription;
use cineforge_service_base::service::asset::AssetManager;
use cineforge_service_base::service::job::JobService;
use cineforge_service_base::service::lock::{LockManager, ProjectGates};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Claims dispatched jobs, runs the matching handler, persists asset
/// output under the project lock and writes exactly one terminal state.
/// Workers never retry failed jobs themselves; that policy lives in the
/// monitor.
pub struct WorkerService {
    job_service: Arc<dyn JobService>,
    asset_manager: Arc<dyn AssetManager>,
    lock_manager: Arc<LockManager>,
    registry: Arc<HandlerRegistry>,
    handler_ctx_template: Arc<HandlerContextTemplate>,
    execution: ExecutionConfig,
    lock_config: LockConfig,
    project_gates: ProjectGates,
}

/// The shared collaborators a per-job `HandlerContext` is stamped from.
pub struct HandlerContextTemplate {
    pub model_client: Arc<dyn crate::clients::GenerativeModelClient>,
    pub media_store: Arc<dyn crate::clients::MediaStore>,
    pub project_repo: Arc<dyn cineforge_service_base::repo::project::ProjectRepo>,
}

impl WorkerService {
    pub fn new(
        job_service: Arc<dyn JobService>,
        asset_manager: Arc<dyn AssetManager>,
        lock_manager: Arc<LockManager>,
        registry: Arc<HandlerRegistry>,
        handler_ctx_template: Arc<HandlerContextTemplate>,
        execution: ExecutionConfig,
        lock_config: LockConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_service,
            asset_manager,
            lock_manager,
            registry,
            handler_ctx_template,
            execution,
            lock_config,
            project_gates: ProjectGates::new(),
        })
    }

    /// Dispatch-event loop: one task per delivery, bounded by the
    /// concurrency semaphore. Claim failure just acknowledges the message;
    /// some other worker won, or the project is at its cap and the monitor
    /// will re-dispatch the stale row later.
    pub async fn run_dispatch_loop(
        self: Arc<Self>,
        mut subscription: Subscription,
        cancel: CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.execution.concurrency.max(1)));
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = subscription.next() => delivery,
            };
            let Some(delivery) = delivery else { break };
            let event: JobEvent = match delivery.envelope.decode() {
                Ok(event) => event,
                Err(error) => {
                    warn!(%error, "discarding undecodable job event");
                    continue;
                }
            };
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let service = self.clone();
            let job_cancel = cancel.child_token();
            tokio::spawn(async move {
                let _permit = permit;
                service.process_dispatch(event, job_cancel).await;
            });
        }
        info!("worker dispatch loop stopped");
    }

    async fn process_dispatch(&self, event: JobEvent, cancel: CancellationToken) {
        self.process_one(&event.job_id, cancel).await;
    }

    /// Claim-execute-finish for a single dispatched job id. Public so an
    /// embedder can drain work without a bus subscription.
    pub async fn process_one(&self, job_id: &cineforge_common::model::JobId, cancel: CancellationToken) {
        let job = match self.job_service.claim_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %job_id, "job not claimable, skipping");
                return;
            }
            Err(error) => {
                warn!(
                    job_id = %job_id,
                    error = %error.to_safe_string(),
                    "claim failed"
                );
                return;
            }
        };

        info!(
            job_id = %job.id,
            project_id = %job.project_id,
            job_type = %job.job_type,
            attempt = job.attempt,
            "executing job"
        );
        let outcome = self.execute(&job, cancel).await;
        self.finish(&job, outcome).await;
    }

    async fn execute(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<HandlerOutput, HandlerError> {
        let Some(handler) = self.registry.get(job.job_type) else {
            return Err(HandlerError::Validation(format!(
                "no handler registered for {}",
                job.job_type
            )));
        };

        let ctx = HandlerContext {
            model_client: self.handler_ctx_template.model_client.clone(),
            media_store: self.handler_ctx_template.media_store.clone(),
            project_repo: self.handler_ctx_template.project_repo.clone(),
            cancel,
        };

        // Safety rejections get a sanitize-and-retry pass before the job
        // fails; everything else is decided on the first call.
        let mut job = job.clone();
        let mut last_safety_error = None;
        for safety_attempt in 0..=self.execution.safety_retries {
            if ctx.cancel.is_cancelled() {
                return Err(HandlerError::Transient("job aborted".to_string()));
            }
            match handler.execute(&ctx, &job).await {
                Err(HandlerError::Safety(message)) => {
                    warn!(
                        job_id = %job.id,
                        safety_attempt,
                        "safety rejection, sanitizing prompt"
                    );
                    last_safety_error = Some(message);
                    job.payload = sanitize_payload(job.payload);
                }
                other => return other,
            }
        }
        Err(HandlerError::Safety(
            last_safety_error.unwrap_or_else(|| "safety rejection".to_string()),
        ))
    }

    async fn finish(&self, job: &Job, outcome: Result<HandlerOutput, HandlerError>) {
        let (state, result, error) = match outcome {
            Ok(output) => match self.write_assets(&job.project_id, output.assets).await {
                Ok(()) => (JobState::Completed, Some(output.result), None),
                Err(error) => (JobState::Failed, None, Some(error)),
            },
            Err(HandlerError::Transient(message)) => (JobState::Failed, None, Some(message)),
            // Exhausted sanitize-and-retry budget: hand off to the normal
            // retry machinery.
            Err(HandlerError::Safety(message)) => (JobState::Failed, None, Some(message)),
            Err(HandlerError::Validation(message)) => (JobState::Fatal, None, Some(message)),
        };

        JOBS_PROCESSED
            .with_label_values(&[job.job_type.to_string().as_str(), state.to_string().as_str()])
            .inc();

        match self
            .job_service
            .update_job_state(&job.id, state, result, error)
            .await
        {
            Ok(Some(updated)) => {
                info!(
                    job_id = %job.id,
                    state = %updated.state,
                    attempt = updated.attempt,
                    "job finished"
                );
            }
            Ok(None) => {
                warn!(job_id = %job.id, "job vanished before terminal write");
            }
            Err(error) => {
                // The row keeps its RUNNING claim; the stale sweeper will
                // recover it.
                error!(
                    job_id = %job.id,
                    error = %error.to_safe_string(),
                    "failed to write terminal job state"
                );
            }
        }
    }

    /// Asset appends are the only cross-row writes a worker does; they run
    /// under the project lock so concurrent appends to one aggregate
    /// serialize.
    async fn write_assets(
        &self,
        project_id: &ProjectId,
        writes: Vec<AssetWrite>,
    ) -> Result<(), String> {
        if writes.is_empty() {
            return Ok(());
        }

        // Serialize in-process first: the lease is re-entrant for one
        // worker id, so two of our own tasks would otherwise both hold it.
        let gate = self.project_gates.gate(project_id.as_str());
        let _guard = gate.lock().await;

        let mut acquired = false;
        for _ in 0..self.execution.lock_acquire_attempts.max(1) {
            match self
                .lock_manager
                .acquire_lock(project_id, &self.lock_config)
                .await
            {
                Ok(true) => {
                    acquired = true;
                    break;
                }
                Ok(false) => {
                    tokio::time::sleep(self.execution.lock_acquire_backoff).await;
                }
                Err(error) => return Err(error.to_safe_string()),
            }
        }
        if !acquired {
            return Err(format!("project lock busy: {project_id}"));
        }

        let result = self.apply_writes(writes).await;
        if let Err(error) = self.lock_manager.release_lock(project_id).await {
            warn!(
                project_id = %project_id,
                error = %error.to_safe_string(),
                "failed to release project lock after asset write"
            );
        }
        result
    }

    async fn apply_writes(&self, writes: Vec<AssetWrite>) -> Result<(), String> {
        for write in writes {
            self.asset_manager
                .create_versioned_assets(
                    &write.scope,
                    write.kind,
                    write.versions,
                    write.set_as_best,
                )
                .await
                .map_err(|error| error.to_safe_string())?;
        }
        Ok(())
    }
}

/// Recursively strips flagged terms from every string in a payload.
fn sanitize_payload(payload: Value) -> Value {
    match payload {
        Value::String(text) => Value::String(sanitize_prompt(&text)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_payload).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key, sanitize_payload(value)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_payload_reaches_nested_strings() {
        let sanitized = sanitize_payload(json!({
            "description": "an unsafe scene",
            "nested": { "list": ["fine", "also unsafe here"] },
            "count": 3,
        }));
        assert_eq!(sanitized["description"], json!("an scene"));
        assert_eq!(sanitized["nested"]["list"][1], json!("also here"));
        assert_eq!(sanitized["count"], json!(3));
    }
}
