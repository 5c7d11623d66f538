use crate::checkpoint::Checkpointer;
use crate::model::{Command, CommandEnvelope, FramePosition, ResolveAction};
use crate::workflow::graph::{RunOutcome, WorkflowGraph};
use crate::workflow::stage::Stage;
use crate::workflow::state::WorkflowState;
use crate::workflow::WorkflowError;
use chrono::Utc;
use cineforge_common::config::LockConfig;
use cineforge_common::model::{
    AssetKind, AssetScope, CommandId, PipelineEvent, PipelineEventType, Project, ProjectId,
    ProjectStatus, SceneId, PIPELINE_EVENTS_TOPIC,
};
use cineforge_common::SafeDisplay;
use cineforge_service_base::events::{BusError, EventBus, EventEnvelope};
use cineforge_service_base::repo::project::{ProjectRecord, ProjectRepo};
use cineforge_service_base::repo::RepoError;
use cineforge_service_base::service::asset::{AssetError, AssetManager};
use cineforge_service_base::service::job::{CreateJob, JobService, JobServiceError};
use cineforge_service_base::service::lock::{LockError, LockManager, ProjectGates};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How many command ids the idempotency window remembers.
const SEEN_COMMANDS_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("project is busy, another command holds its lock: {0}")]
    ProjectBusy(ProjectId),
    #[error("project already exists: {0}")]
    ProjectAlreadyExists(ProjectId),
    #[error("no checkpoint for project: {0}")]
    NoCheckpoint(ProjectId),
    #[error("no pending intervention for project: {0}")]
    NoPendingIntervention(ProjectId),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error(transparent)]
    InternalLockError(#[from] LockError),
    #[error(transparent)]
    InternalWorkflowError(#[from] WorkflowError),
    #[error(transparent)]
    InternalJobError(#[from] JobServiceError),
    #[error(transparent)]
    InternalAssetError(#[from] AssetError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error(transparent)]
    InternalBusError(#[from] BusError),
}

impl SafeDisplay for OperatorError {
    fn to_safe_string(&self) -> String {
        match self {
            Self::ProjectBusy(_)
            | Self::ProjectAlreadyExists(_)
            | Self::NoCheckpoint(_)
            | Self::NoPendingIntervention(_)
            | Self::InvalidCommand(_) => self.to_string(),
            Self::InternalLockError(inner) => inner.to_safe_string(),
            Self::InternalWorkflowError(inner) => inner.to_safe_string(),
            Self::InternalJobError(inner) => inner.to_safe_string(),
            Self::InternalAssetError(inner) => inner.to_safe_string(),
            Self::InternalRepoError(inner) => inner.to_safe_string(),
            Self::InternalBusError(inner) => inner.to_safe_string(),
        }
    }
}

/// The command plane: accepts external commands for a project, serializes
/// them through the project lock, drives the workflow graph and publishes
/// pipeline events. Also the consumer-side target of job completion events
/// (each of which is just a `RESUME_PIPELINE`).
pub struct Operator {
    project_repo: Arc<dyn ProjectRepo>,
    job_service: Arc<dyn JobService>,
    asset_manager: Arc<dyn AssetManager>,
    lock_manager: Arc<LockManager>,
    checkpointer: Arc<Checkpointer>,
    graph: WorkflowGraph,
    event_bus: Arc<dyn EventBus>,
    lock_config: LockConfig,
    project_gates: ProjectGates,
    aborts: Mutex<HashMap<String, CancellationToken>>,
    seen_commands: Mutex<(VecDeque<String>, HashSet<String>)>,
}

impl Operator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_repo: Arc<dyn ProjectRepo>,
        job_service: Arc<dyn JobService>,
        asset_manager: Arc<dyn AssetManager>,
        lock_manager: Arc<LockManager>,
        checkpointer: Arc<Checkpointer>,
        graph: WorkflowGraph,
        event_bus: Arc<dyn EventBus>,
        lock_config: LockConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            project_repo,
            job_service,
            asset_manager,
            lock_manager,
            checkpointer,
            graph,
            event_bus,
            lock_config,
            project_gates: ProjectGates::new(),
            aborts: Mutex::new(HashMap::new()),
            seen_commands: Mutex::new((VecDeque::new(), HashSet::new())),
        })
    }

    pub async fn handle_command(&self, envelope: CommandEnvelope) -> Result<(), OperatorError> {
        if self.already_seen(&envelope.command_id) {
            info!(command_id = %envelope.command_id, "duplicate command, ignoring");
            return Ok(());
        }
        let name = command_name(&envelope.command);
        info!(
            command_id = %envelope.command_id,
            project_id = %envelope.project_id,
            command = name,
            "handling command"
        );

        let project_id = envelope.project_id.clone();
        let command_id = envelope.command_id.clone();
        let result = match envelope.command {
            Command::StartPipeline {
                initial_prompt,
                audio_gcs_uri,
                metadata,
            } => {
                self.start_pipeline(&project_id, &command_id, initial_prompt, audio_gcs_uri, metadata)
                    .await
            }
            Command::ResumePipeline => self.resume_pipeline(&project_id, Some(&command_id)).await,
            Command::RegenerateScene {
                scene_id,
                prompt_modification,
            } => {
                self.regenerate_scene(&project_id, &command_id, scene_id, prompt_modification)
                    .await
            }
            Command::RegenerateFrame {
                scene_id,
                frame,
                prompt_modification,
            } => {
                self.regenerate_frame(&project_id, scene_id, frame, prompt_modification)
                    .await
            }
            Command::UpdateSceneAsset {
                scene_id,
                asset_key,
                version,
            } => {
                self.update_scene_asset(&project_id, &command_id, scene_id, asset_key, version)
                    .await
            }
            Command::ResolveIntervention { action } => {
                self.resolve_intervention(&project_id, &command_id, action).await
            }
            Command::StopPipeline => self.stop_pipeline(&project_id).await,
        };
        crate::metrics::COMMANDS_HANDLED
            .with_label_values(&[name, if result.is_ok() { "ok" } else { "error" }])
            .inc();
        result
    }

    /// Entry point for `JOB_COMPLETED` / `JOB_FAILED` deliveries. Safe to
    /// call any number of times: with no next step the graph is a no-op.
    pub async fn resume_on_job_event(&self, project_id: &ProjectId) -> Result<(), OperatorError> {
        match self.resume_pipeline(project_id, None).await {
            Ok(()) => Ok(()),
            // Nothing to resume (e.g. a job enqueued outside the graph).
            Err(OperatorError::NoCheckpoint(_)) => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn start_pipeline(
        &self,
        project_id: &ProjectId,
        command_id: &CommandId,
        initial_prompt: String,
        audio_gcs_uri: Option<String>,
        metadata: Value,
    ) -> Result<(), OperatorError> {
        self.with_lock(project_id, async {
            if self.project_repo.get(project_id.as_str()).await?.is_some() {
                return Err(OperatorError::ProjectAlreadyExists(project_id.clone()));
            }

            let now = Utc::now();
            let mut project_metadata = json!({
                "initialPrompt": initial_prompt,
                "audioGcsUri": audio_gcs_uri,
            });
            if let (Value::Object(base), Value::Object(extra)) =
                (&mut project_metadata, &metadata)
            {
                for (key, value) in extra {
                    base.insert(key.clone(), value.clone());
                }
            }
            let mut project = Project::new(project_id.clone(), project_metadata, now);
            project.status = ProjectStatus::Generating;
            let record =
                ProjectRecord::try_from(project.clone()).map_err(WorkflowError::InvalidState)?;
            match self.project_repo.create(record).await {
                Ok(()) => {}
                Err(RepoError::UniqueViolation(_)) => {
                    return Err(OperatorError::ProjectAlreadyExists(project_id.clone()));
                }
                Err(other) => return Err(other.into()),
            }

            self.publish_pipeline_event(
                PipelineEventType::WorkflowStarted,
                project_id,
                Some(command_id),
                json!({ "project": project }),
            )
            .await?;

            let mut state = WorkflowState::new(project_id.clone());
            self.checkpointer.save(&state).await?;
            self.run_graph(&mut state, Some(command_id)).await
        })
        .await
    }

    async fn resume_pipeline(
        &self,
        project_id: &ProjectId,
        command_id: Option<&CommandId>,
    ) -> Result<(), OperatorError> {
        self.with_lock(project_id, async {
            let mut state = self
                .checkpointer
                .load_latest(project_id)
                .await?
                .ok_or_else(|| OperatorError::NoCheckpoint(project_id.clone()))?;
            self.run_graph(&mut state, command_id).await
        })
        .await
    }

    async fn regenerate_scene(
        &self,
        project_id: &ProjectId,
        command_id: &CommandId,
        scene_id: SceneId,
        prompt_modification: Option<String>,
    ) -> Result<(), OperatorError> {
        self.with_lock(project_id, async {
            let mut project = self.load_project(project_id).await?;
            if !project.force_regenerate_scene_ids.contains(&scene_id) {
                project.force_regenerate_scene_ids.push(scene_id.clone());
            }
            project.status = ProjectStatus::Generating;
            self.save_project(project).await?;

            let mut state = self
                .checkpointer
                .load_latest(project_id)
                .await?
                .unwrap_or_else(|| WorkflowState::new(project_id.clone()));
            state.clear_interrupt();
            if let Some(modification) = prompt_modification {
                state.revised_params = Some(json!({ "promptModification": modification }));
            }
            // The downstream singleton stages consume the regenerated
            // video, so their completed rows are superseded too.
            state.retry_nodes.insert("render_video".to_string());
            state.retry_nodes.insert("finalize".to_string());
            // Jump the graph to scene processing.
            state.current_stage = Some(Stage::ProcessScene);
            self.checkpointer.save(&state).await?;
            self.run_graph(&mut state, Some(command_id)).await
        })
        .await
    }

    /// Out-of-graph regeneration: enqueues a FRAME_RENDER job directly.
    async fn regenerate_frame(
        &self,
        project_id: &ProjectId,
        scene_id: SceneId,
        frame: FramePosition,
        prompt_modification: Option<String>,
    ) -> Result<(), OperatorError> {
        let asset_key = match frame {
            FramePosition::Start => AssetKind::SceneStartFrame,
            FramePosition::End => AssetKind::SceneEndFrame,
        };
        let request = CreateJob {
            job_type: cineforge_common::model::JobType::FrameRender,
            project_id: project_id.clone(),
            payload: json!({
                "sceneId": scene_id,
                "frame": frame.to_string(),
                "promptModification": prompt_modification,
            }),
            unique_key: Some(format!("frame:{scene_id}:{frame}")),
            asset_key: Some(asset_key),
            max_retries: None,
        };
        match self.job_service.create_job(request).await {
            Ok(job) => {
                info!(job_id = %job.id, scene_id = %scene_id, "enqueued frame regeneration");
                Ok(())
            }
            // An identical regeneration is already in flight.
            Err(JobServiceError::AlreadyActive(_)) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }

    async fn update_scene_asset(
        &self,
        project_id: &ProjectId,
        command_id: &CommandId,
        scene_id: SceneId,
        asset_key: AssetKind,
        version: u32,
    ) -> Result<(), OperatorError> {
        self.with_lock(project_id, async {
            self.asset_manager
                .set_best_version(&AssetScope::Scene(scene_id.clone()), asset_key, version)
                .await?;
            self.broadcast_full_state(project_id, Some(command_id)).await
        })
        .await
    }

    async fn resolve_intervention(
        &self,
        project_id: &ProjectId,
        command_id: &CommandId,
        action: ResolveAction,
    ) -> Result<(), OperatorError> {
        self.with_lock(project_id, async {
            let mut state = self
                .checkpointer
                .load_latest(project_id)
                .await?
                .ok_or_else(|| OperatorError::NoCheckpoint(project_id.clone()))?;
            let interrupt = state
                .interrupt
                .clone()
                .filter(|interrupt| interrupt.interrupt_type.needs_operator())
                .ok_or_else(|| OperatorError::NoPendingIntervention(project_id.clone()))?;
            let failing_units = failure_unique_keys(&interrupt.error_details);

            match action {
                ResolveAction::Abort => {
                    state.record_error(
                        &interrupt.node_name,
                        interrupt.error.as_deref().unwrap_or("aborted by operator"),
                    );
                    state.clear_interrupt();
                    self.checkpointer.save(&state).await?;

                    let mut project = self.load_project(project_id).await?;
                    project.status = ProjectStatus::Error;
                    self.save_project(project).await?;

                    self.publish_pipeline_event(
                        PipelineEventType::WorkflowFailed,
                        project_id,
                        Some(command_id),
                        json!({
                            "error": interrupt.error,
                            "nodeName": interrupt.node_name,
                        }),
                    )
                    .await?;
                    Ok(())
                }
                ResolveAction::Skip => {
                    state.record_error(
                        &interrupt.node_name,
                        &format!("operator skipped: {:?}", failing_units),
                    );
                    for unit in &failing_units {
                        state.skipped_nodes.insert(unit.clone());
                    }
                    state.clear_interrupt();
                    state.interrupt_resolved = true;
                    self.checkpointer.save(&state).await?;

                    if interrupt.node_name == "process_scene" {
                        self.publish_scene_skips(project_id, command_id, &failing_units, &interrupt)
                            .await?;
                    }
                    self.run_graph(&mut state, Some(command_id)).await
                }
                ResolveAction::RetryWithRevisedParams { revised_params } => {
                    for unit in &failing_units {
                        state.retry_nodes.insert(unit.clone());
                    }
                    state.revised_params = Some(match (state.revised_params.take(), revised_params) {
                        (Some(Value::Object(mut base)), Value::Object(overlay)) => {
                            for (key, value) in overlay {
                                base.insert(key, value);
                            }
                            Value::Object(base)
                        }
                        (_, revised) => revised,
                    });
                    state.clear_interrupt();
                    state.interrupt_resolved = true;
                    self.checkpointer.save(&state).await?;

                    let mut project = self.load_project(project_id).await?;
                    project.metrics.interventions += 1;
                    self.save_project(project).await?;

                    self.run_graph(&mut state, Some(command_id)).await
                }
            }
        })
        .await
    }

    async fn stop_pipeline(&self, project_id: &ProjectId) -> Result<(), OperatorError> {
        let signalled = {
            let aborts = self.locked_aborts();
            aborts.get(project_id.as_str()).map(|token| token.cancel()).is_some()
        };
        if signalled {
            info!(project_id = %project_id, "abort signalled");
        } else {
            warn!(project_id = %project_id, "stop requested but no pipeline is running");
        }
        Ok(())
    }

    async fn run_graph(
        &self,
        state: &mut WorkflowState,
        command_id: Option<&CommandId>,
    ) -> Result<(), OperatorError> {
        let project_id = state.project_id.clone();
        let cancel = self.register_abort(&project_id);

        let outcome = self.graph.run(state, &cancel).await;
        self.clear_abort(&project_id);

        let outcome_label = match &outcome {
            Ok(RunOutcome::Completed) => "completed",
            Ok(RunOutcome::Suspended(_)) => "suspended",
            Ok(RunOutcome::NoNextStep) => "no_next_step",
            Err(WorkflowError::Aborted(_)) => "aborted",
            Err(_) => "error",
        };
        crate::metrics::WORKFLOW_OUTCOMES
            .with_label_values(&[outcome_label])
            .inc();

        match outcome {
            Ok(RunOutcome::Completed) => {
                self.publish_pipeline_event(
                    PipelineEventType::WorkflowCompleted,
                    &project_id,
                    command_id,
                    Value::Null,
                )
                .await?;
                self.broadcast_full_state(&project_id, command_id).await
            }
            Ok(RunOutcome::Suspended(interrupt)) => {
                info!(
                    project_id = %project_id,
                    interrupt_type = %interrupt.interrupt_type,
                    node_name = %interrupt.node_name,
                    "workflow suspended"
                );
                Ok(())
            }
            Ok(RunOutcome::NoNextStep) => Ok(()),
            Err(WorkflowError::Aborted(_)) => {
                warn!(project_id = %project_id, "workflow aborted by operator");
                Ok(())
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn with_lock<T>(
        &self,
        project_id: &ProjectId,
        run: impl std::future::Future<Output = Result<T, OperatorError>>,
    ) -> Result<T, OperatorError> {
        // The lease is re-entrant for our worker id; the gate serializes
        // concurrent command/event handling inside this process.
        let gate = self.project_gates.gate(project_id.as_str());
        let Ok(_guard) = gate.try_lock() else {
            return Err(OperatorError::ProjectBusy(project_id.clone()));
        };
        let acquired = self
            .lock_manager
            .acquire_lock(project_id, &self.lock_config)
            .await?;
        if !acquired {
            return Err(OperatorError::ProjectBusy(project_id.clone()));
        }
        let result = run.await;
        if let Err(error) = self.lock_manager.release_lock(project_id).await {
            warn!(
                project_id = %project_id,
                error = %error.to_safe_string(),
                "failed to release project lock"
            );
        }
        result
    }

    async fn publish_scene_skips(
        &self,
        project_id: &ProjectId,
        command_id: &CommandId,
        failing_units: &[String],
        interrupt: &cineforge_common::model::Interrupt,
    ) -> Result<(), OperatorError> {
        for unit in failing_units {
            let scene_id = SceneId(unit.clone());
            let video_url = match self
                .asset_manager
                .best_version(&AssetScope::Scene(scene_id.clone()), AssetKind::SceneVideo)
                .await
            {
                Ok(best) => best.map(|version| version.data),
                Err(AssetError::ScopeNotFound(_)) => None,
                Err(other) => return Err(other.into()),
            };
            self.publish_pipeline_event(
                PipelineEventType::SceneSkipped,
                project_id,
                Some(command_id),
                json!({
                    "sceneId": scene_id,
                    "reason": interrupt.error,
                    "videoUrl": video_url,
                }),
            )
            .await?;
        }
        Ok(())
    }

    async fn broadcast_full_state(
        &self,
        project_id: &ProjectId,
        command_id: Option<&CommandId>,
    ) -> Result<(), OperatorError> {
        let project = self.load_project(project_id).await?;
        let scenes = self.project_repo.get_scenes(project_id.as_str()).await?;
        let scenes: Vec<Value> = scenes
            .into_iter()
            .filter_map(|record| {
                cineforge_common::model::Scene::try_from(record)
                    .ok()
                    .and_then(|scene| serde_json::to_value(scene).ok())
            })
            .collect();
        self.publish_pipeline_event(
            PipelineEventType::FullState,
            project_id,
            command_id,
            json!({ "project": project, "scenes": scenes }),
        )
        .await
    }

    async fn publish_pipeline_event(
        &self,
        event_type: PipelineEventType,
        project_id: &ProjectId,
        command_id: Option<&CommandId>,
        payload: Value,
    ) -> Result<(), OperatorError> {
        let event = PipelineEvent::new(
            event_type,
            project_id.clone(),
            command_id.cloned(),
            payload,
        );
        let envelope = EventEnvelope::try_from(&event)?;
        self.event_bus.publish(PIPELINE_EVENTS_TOPIC, envelope).await?;
        Ok(())
    }

    async fn load_project(&self, project_id: &ProjectId) -> Result<Project, OperatorError> {
        let record = self
            .project_repo
            .get(project_id.as_str())
            .await?
            .ok_or_else(|| {
                OperatorError::InternalWorkflowError(WorkflowError::ProjectNotFound(
                    project_id.clone(),
                ))
            })?;
        Project::try_from(record)
            .map_err(|e| OperatorError::InternalWorkflowError(WorkflowError::InvalidState(e)))
    }

    async fn save_project(&self, project: Project) -> Result<(), OperatorError> {
        let record = ProjectRecord::try_from(project)
            .map_err(|e| OperatorError::InternalWorkflowError(WorkflowError::InvalidState(e)))?;
        self.project_repo.update(record).await?;
        Ok(())
    }

    fn register_abort(&self, project_id: &ProjectId) -> CancellationToken {
        let token = CancellationToken::new();
        self.locked_aborts()
            .insert(project_id.as_str().to_string(), token.clone());
        token
    }

    fn clear_abort(&self, project_id: &ProjectId) {
        self.locked_aborts().remove(project_id.as_str());
    }

    fn already_seen(&self, command_id: &CommandId) -> bool {
        let mut guard = match self.seen_commands.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (order, seen) = &mut *guard;
        if seen.contains(command_id.as_str()) {
            return true;
        }
        order.push_back(command_id.as_str().to_string());
        seen.insert(command_id.as_str().to_string());
        while order.len() > SEEN_COMMANDS_CAPACITY {
            if let Some(evicted) = order.pop_front() {
                seen.remove(&evicted);
            }
        }
        false
    }

    fn locked_aborts(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.aborts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::StartPipeline { .. } => "START_PIPELINE",
        Command::ResumePipeline => "RESUME_PIPELINE",
        Command::RegenerateScene { .. } => "REGENERATE_SCENE",
        Command::RegenerateFrame { .. } => "REGENERATE_FRAME",
        Command::UpdateSceneAsset { .. } => "UPDATE_SCENE_ASSET",
        Command::ResolveIntervention { .. } => "RESOLVE_INTERVENTION",
        Command::StopPipeline => "STOP_PIPELINE",
    }
}

fn failure_unique_keys(error_details: &Value) -> Vec<String> {
    error_details
        .get("failures")
        .and_then(Value::as_array)
        .map(|failures| {
            failures
                .iter()
                .filter_map(|failure| {
                    failure
                        .get("uniqueKey")
                        .or_else(|| failure.get("unique_key"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default()
}
