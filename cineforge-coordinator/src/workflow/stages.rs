use crate::workflow::dispatcher::{BatchOutcome, Dispatcher, EnsureOutcome, JobSpec};
use crate::workflow::stage::Stage;
use crate::workflow::state::WorkflowState;
use crate::workflow::WorkflowError;
use chrono::Utc;
use cineforge_common::config::PipelineConfig;
use cineforge_common::model::{
    AssetKind, ExecutionMode, Interrupt, JobType, Project, ProjectStatus, Scene, SceneId,
    Storyboard,
};
use cineforge_service_base::repo::project::{
    CharacterRecord, LocationRecord, ProjectRepo, SceneRecord,
};
use cineforge_service_base::service::asset::AssetManager;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// What a stage hands back to the interpreter: move on (or finish), or
/// park the workflow on an interrupt.
#[derive(Debug)]
pub enum StageOutcome {
    Advance(Option<Stage>),
    Suspend(Interrupt),
}

/// Everything a stage body is allowed to touch. Stages must not reach
/// around this to talk to the outside world.
pub struct StageContext {
    pub project_repo: Arc<dyn ProjectRepo>,
    pub asset_manager: Arc<dyn AssetManager>,
    pub dispatcher: Dispatcher,
    pub pipeline: PipelineConfig,
}

/// Payload shape the enrichment stage gets back from its worker.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrichmentResult {
    storyboard: Storyboard,
    #[serde(default)]
    characters: Vec<EnrichedEntity>,
    #[serde(default)]
    locations: Vec<EnrichedEntity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrichedEntity {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
}

/// The table of stage handlers. One method per stage; every method
/// delegates its real work to exactly one `ensure_job` /
/// `ensure_batch_jobs` call.
pub struct StageRunner {
    ctx: StageContext,
}

impl StageRunner {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }

    pub async fn run_stage(
        &self,
        stage: Stage,
        state: &mut WorkflowState,
    ) -> Result<StageOutcome, WorkflowError> {
        match stage {
            Stage::ExpandCreativePrompt => self.expand_creative_prompt(state).await,
            Stage::CreateScenesFromAudio => self.create_scenes_from_audio(state).await,
            Stage::GenerateStoryboardExclusivelyFromPrompt => {
                self.generate_storyboard_exclusively_from_prompt(state).await
            }
            Stage::EnrichStoryboardAndScenes => self.enrich_storyboard_and_scenes(state).await,
            Stage::SemanticAnalysis => self.semantic_analysis(state).await,
            Stage::GenerateCharacterAssets => self.generate_character_assets(state).await,
            Stage::GenerateLocationAssets => self.generate_location_assets(state).await,
            Stage::GenerateSceneAssets => self.generate_scene_assets(state).await,
            Stage::ProcessScene => self.process_scene(state).await,
            Stage::RenderVideo => self.render_video(state).await,
            Stage::Finalize => self.finalize(state).await,
        }
    }

    /// The entry router, consulted at `__start__` and on every resume that
    /// has no saved stage. `None` means there is nothing left to run.
    pub async fn entry_route(
        &self,
        state: &WorkflowState,
    ) -> Result<Option<Stage>, WorkflowError> {
        let project = self.load_project(state).await?;
        if project.status == ProjectStatus::Complete {
            return Ok(None);
        }
        let scenes = self.load_scenes(state).await?;

        let stage = if scenes
            .iter()
            .any(|scene| scene.assets.has_best(AssetKind::SceneVideo))
        {
            Stage::ProcessScene
        } else if project.storyboard_has_scenes() && !project.generation_rules.is_empty() {
            Stage::GenerateCharacterAssets
        } else if project.storyboard_has_scenes() {
            Stage::SemanticAnalysis
        } else if project.assets.has_best(AssetKind::EnhancedPrompt) {
            Stage::EnrichStoryboardAndScenes
        } else {
            Stage::ExpandCreativePrompt
        };
        Ok(Some(stage))
    }

    async fn expand_creative_prompt(
        &self,
        state: &mut WorkflowState,
    ) -> Result<StageOutcome, WorkflowError> {
        let project = self.load_project(state).await?;
        let payload = json!({
            "initialPrompt": project.metadata.get("initialPrompt").cloned().unwrap_or(Value::Null),
        });
        let spec = JobSpec::new(
            JobType::ExpandCreativePrompt,
            "expand_creative_prompt",
            Some(AssetKind::EnhancedPrompt),
            payload,
        );
        match self
            .ctx
            .dispatcher
            .ensure_job(state, "expand_creative_prompt", spec)
            .await?
        {
            EnsureOutcome::Suspend { interrupt, .. } => Ok(StageOutcome::Suspend(interrupt)),
            EnsureOutcome::Ready(_) => {
                let next = if audio_uri(&project).is_some() {
                    Stage::CreateScenesFromAudio
                } else {
                    Stage::GenerateStoryboardExclusivelyFromPrompt
                };
                Ok(StageOutcome::Advance(Some(next)))
            }
        }
    }

    async fn create_scenes_from_audio(
        &self,
        state: &mut WorkflowState,
    ) -> Result<StageOutcome, WorkflowError> {
        let mut project = self.load_project(state).await?;
        let payload = json!({
            "audioGcsUri": audio_uri(&project),
            "enhancedPrompt": self.best_data(state, AssetKind::EnhancedPrompt).await?,
        });
        let spec = JobSpec::new(
            JobType::CreateScenesFromAudio,
            "create_scenes_from_audio",
            Some(AssetKind::AudioAnalysis),
            payload,
        );
        match self
            .ctx
            .dispatcher
            .ensure_job(state, "create_scenes_from_audio", spec)
            .await?
        {
            EnsureOutcome::Suspend { interrupt, .. } => Ok(StageOutcome::Suspend(interrupt)),
            EnsureOutcome::Ready(result) => {
                if let Some(analysis) = result.get("audioAnalysis") {
                    project.audio_analysis = Some(analysis.clone());
                }
                if let Some(raw) = result.get("storyboard") {
                    let storyboard: Storyboard = serde_json::from_value(raw.clone())
                        .map_err(|e| WorkflowError::InvalidState(format!(
                            "audio segmentation returned a bad storyboard: {e}"
                        )))?;
                    project.storyboard = Some(storyboard);
                }
                self.save_project(project).await?;
                Ok(StageOutcome::Advance(Some(Stage::EnrichStoryboardAndScenes)))
            }
        }
    }

    async fn generate_storyboard_exclusively_from_prompt(
        &self,
        state: &mut WorkflowState,
    ) -> Result<StageOutcome, WorkflowError> {
        let mut project = self.load_project(state).await?;
        let payload = json!({
            "enhancedPrompt": self.best_data(state, AssetKind::EnhancedPrompt).await?,
        });
        let spec = JobSpec::new(
            JobType::GenerateStoryboard,
            "generate_storyboard",
            Some(AssetKind::Storyboard),
            payload,
        );
        match self
            .ctx
            .dispatcher
            .ensure_job(state, "generate_storyboard_exclusively_from_prompt", spec)
            .await?
        {
            EnsureOutcome::Suspend { interrupt, .. } => Ok(StageOutcome::Suspend(interrupt)),
            EnsureOutcome::Ready(result) => {
                let raw = result.get("storyboard").cloned().ok_or_else(|| {
                    WorkflowError::InvalidState("storyboard job returned no storyboard".into())
                })?;
                let storyboard: Storyboard = serde_json::from_value(raw).map_err(|e| {
                    WorkflowError::InvalidState(format!("bad storyboard payload: {e}"))
                })?;
                project.storyboard = Some(storyboard);
                self.save_project(project).await?;
                Ok(StageOutcome::Advance(Some(Stage::EnrichStoryboardAndScenes)))
            }
        }
    }

    async fn enrich_storyboard_and_scenes(
        &self,
        state: &mut WorkflowState,
    ) -> Result<StageOutcome, WorkflowError> {
        let mut project = self.load_project(state).await?;
        // A missing storyboard is legal here: the worker generates one from
        // the enhanced prompt before enriching it.
        let payload = json!({
            "storyboard": project.storyboard,
            "enhancedPrompt": self.best_data(state, AssetKind::EnhancedPrompt).await?,
        });
        let spec = JobSpec::new(
            JobType::EnhanceStoryboard,
            "enrich_storyboard_and_scenes",
            Some(AssetKind::Storyboard),
            payload,
        );
        match self
            .ctx
            .dispatcher
            .ensure_job(state, "enrich_storyboard_and_scenes", spec)
            .await?
        {
            EnsureOutcome::Suspend { interrupt, .. } => Ok(StageOutcome::Suspend(interrupt)),
            EnsureOutcome::Ready(result) => {
                let enrichment: EnrichmentResult = serde_json::from_value(result)
                    .map_err(|e| {
                        WorkflowError::InvalidState(format!("bad enrichment payload: {e}"))
                    })?;
                self.materialize_entities(state, &enrichment).await?;
                project.storyboard = Some(enrichment.storyboard);
                self.save_project(project).await?;
                Ok(StageOutcome::Advance(Some(Stage::SemanticAnalysis)))
            }
        }
    }

    async fn semantic_analysis(
        &self,
        state: &mut WorkflowState,
    ) -> Result<StageOutcome, WorkflowError> {
        let mut project = self.load_project(state).await?;
        let payload = json!({ "storyboard": project.storyboard });
        let spec = JobSpec::new(JobType::SemanticAnalysis, "semantic_analysis", None, payload);
        match self
            .ctx
            .dispatcher
            .ensure_job(state, "semantic_analysis", spec)
            .await?
        {
            EnsureOutcome::Suspend { interrupt, .. } => Ok(StageOutcome::Suspend(interrupt)),
            EnsureOutcome::Ready(result) => {
                let rules: Vec<String> = result
                    .get("generationRules")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| {
                        WorkflowError::InvalidState(format!("bad generation rules: {e}"))
                    })?
                    .unwrap_or_default();
                project.update_generation_rules(rules, Utc::now());
                self.save_project(project).await?;
                Ok(StageOutcome::Advance(Some(Stage::GenerateCharacterAssets)))
            }
        }
    }

    async fn generate_character_assets(
        &self,
        state: &mut WorkflowState,
    ) -> Result<StageOutcome, WorkflowError> {
        let characters = self
            .ctx
            .project_repo
            .get_characters(state.project_id.as_str())
            .await?;
        if characters.is_empty() {
            return Ok(StageOutcome::Advance(Some(Stage::GenerateLocationAssets)));
        }
        let specs = characters
            .iter()
            .map(|character| {
                JobSpec::new(
                    JobType::GenerateCharacterAssets,
                    &character.id,
                    Some(AssetKind::CharacterImage),
                    json!({
                        "characterId": character.id,
                        "name": character.name,
                        "description": character.description,
                    }),
                )
            })
            .collect();
        match self
            .ctx
            .dispatcher
            .ensure_batch_jobs(state, "generate_character_assets", specs)
            .await?
        {
            BatchOutcome::Suspend { interrupt, .. } => Ok(StageOutcome::Suspend(interrupt)),
            BatchOutcome::Ready(_) => {
                Ok(StageOutcome::Advance(Some(Stage::GenerateLocationAssets)))
            }
        }
    }

    async fn generate_location_assets(
        &self,
        state: &mut WorkflowState,
    ) -> Result<StageOutcome, WorkflowError> {
        let locations = self
            .ctx
            .project_repo
            .get_locations(state.project_id.as_str())
            .await?;
        if locations.is_empty() {
            return Ok(StageOutcome::Advance(Some(Stage::GenerateSceneAssets)));
        }
        let specs = locations
            .iter()
            .map(|location| {
                JobSpec::new(
                    JobType::GenerateLocationAssets,
                    &location.id,
                    Some(AssetKind::LocationImage),
                    json!({
                        "locationId": location.id,
                        "name": location.name,
                        "description": location.description,
                    }),
                )
            })
            .collect();
        match self
            .ctx
            .dispatcher
            .ensure_batch_jobs(state, "generate_location_assets", specs)
            .await?
        {
            BatchOutcome::Suspend { interrupt, .. } => Ok(StageOutcome::Suspend(interrupt)),
            BatchOutcome::Ready(_) => Ok(StageOutcome::Advance(Some(Stage::GenerateSceneAssets))),
        }
    }

    async fn generate_scene_assets(
        &self,
        state: &mut WorkflowState,
    ) -> Result<StageOutcome, WorkflowError> {
        let scenes = self.load_scenes(state).await?;
        if scenes.is_empty() {
            return Ok(StageOutcome::Advance(Some(Stage::ProcessScene)));
        }
        let mut specs = Vec::with_capacity(scenes.len() * 2);
        for scene in &scenes {
            for (frame, asset_kind) in [
                ("start", AssetKind::SceneStartFrame),
                ("end", AssetKind::SceneEndFrame),
            ] {
                specs.push(JobSpec::new(
                    JobType::GenerateSceneFrames,
                    &format!("{}:{frame}", scene.id),
                    Some(asset_kind),
                    json!({
                        "sceneId": scene.id,
                        "frame": frame,
                        "description": scene.description,
                        "characterIds": scene.character_ids,
                        "locationId": scene.location_id,
                    }),
                ));
            }
        }
        match self
            .ctx
            .dispatcher
            .ensure_batch_jobs(state, "generate_scene_assets", specs)
            .await?
        {
            BatchOutcome::Suspend { interrupt, .. } => Ok(StageOutcome::Suspend(interrupt)),
            BatchOutcome::Ready(_) => Ok(StageOutcome::Advance(Some(Stage::ProcessScene))),
        }
    }

    /// Per-scene video synthesis. Sequential mode walks scenes in index
    /// order, one suspension at a time; parallel mode fans out through the
    /// batch primitive, throttled by `max_parallel_jobs`.
    async fn process_scene(
        &self,
        state: &mut WorkflowState,
    ) -> Result<StageOutcome, WorkflowError> {
        let mut project = self.load_project(state).await?;
        let scenes = self.load_scenes(state).await?;

        let pending: Vec<&Scene> = scenes
            .iter()
            .filter(|scene| {
                if state.skipped_nodes.contains(scene.id.as_str()) {
                    return false;
                }
                let forced = project.force_regenerate_scene_ids.contains(&scene.id);
                forced || !scene.assets.has_best(AssetKind::SceneVideo)
            })
            .collect();

        if pending.is_empty() {
            project.current_scene_index = scenes.len() as i32;
            self.save_project(project).await?;
            return Ok(StageOutcome::Advance(Some(Stage::RenderVideo)));
        }

        match self.ctx.pipeline.execution_mode {
            ExecutionMode::Sequential => {
                let scene = pending[0];
                let forced = project.force_regenerate_scene_ids.contains(&scene.id);
                let spec = self.scene_video_spec(scene, forced);
                match self
                    .ctx
                    .dispatcher
                    .ensure_job(state, "process_scene", spec)
                    .await?
                {
                    EnsureOutcome::Suspend { interrupt, created } => {
                        if forced && created {
                            clear_force_flag(&mut project, &scene.id);
                            self.save_project(project).await?;
                        }
                        Ok(StageOutcome::Suspend(interrupt))
                    }
                    EnsureOutcome::Ready(_) => {
                        project.current_scene_index = scene.index;
                        project.metrics.scenes_completed += 1;
                        clear_force_flag(&mut project, &scene.id);
                        self.save_project(project).await?;
                        info!(
                            project_id = %state.project_id,
                            scene_id = %scene.id,
                            "scene video ready"
                        );
                        // Re-enter the same stage for the next pending scene.
                        Ok(StageOutcome::Advance(Some(Stage::ProcessScene)))
                    }
                }
            }
            ExecutionMode::Parallel => {
                let specs = pending
                    .iter()
                    .map(|scene| {
                        let forced = project.force_regenerate_scene_ids.contains(&scene.id);
                        self.scene_video_spec(scene, forced)
                    })
                    .collect();
                match self
                    .ctx
                    .dispatcher
                    .ensure_batch_jobs(state, "process_scene", specs)
                    .await?
                {
                    BatchOutcome::Suspend { interrupt, created } => {
                        if !created.is_empty() {
                            for unique_key in &created {
                                clear_force_flag(&mut project, &SceneId(unique_key.clone()));
                            }
                            self.save_project(project).await?;
                        }
                        Ok(StageOutcome::Suspend(interrupt))
                    }
                    BatchOutcome::Ready(_) => {
                        project.current_scene_index = scenes.len() as i32;
                        project.metrics.scenes_completed += pending.len() as u64;
                        self.save_project(project).await?;
                        Ok(StageOutcome::Advance(Some(Stage::RenderVideo)))
                    }
                }
            }
        }
    }

    async fn render_video(
        &self,
        state: &mut WorkflowState,
    ) -> Result<StageOutcome, WorkflowError> {
        let scenes = self.load_scenes(state).await?;
        let mut scene_videos = Vec::new();
        for scene in &scenes {
            if let Some(version) = scene.assets.best_version(AssetKind::SceneVideo) {
                scene_videos.push(json!({
                    "sceneId": scene.id,
                    "videoUri": version.data,
                    "version": version.version,
                }));
            }
        }
        if scene_videos.is_empty() {
            return Err(WorkflowError::InvalidState(
                "render_video reached with no scene videos".into(),
            ));
        }
        let spec = JobSpec::new(
            JobType::RenderVideo,
            "render_video",
            Some(AssetKind::RenderedVideo),
            json!({ "sceneVideos": scene_videos }),
        );
        match self
            .ctx
            .dispatcher
            .ensure_job(state, "render_video", spec)
            .await?
        {
            EnsureOutcome::Suspend { interrupt, .. } => Ok(StageOutcome::Suspend(interrupt)),
            EnsureOutcome::Ready(_) => Ok(StageOutcome::Advance(Some(Stage::Finalize))),
        }
    }

    async fn finalize(&self, state: &mut WorkflowState) -> Result<StageOutcome, WorkflowError> {
        let mut project = self.load_project(state).await?;
        let payload = json!({
            "renderedVideo": self.best_data(state, AssetKind::RenderedVideo).await?,
        });
        let spec = JobSpec::new(
            JobType::Finalize,
            "finalize",
            Some(AssetKind::FinalOutput),
            payload,
        );
        match self.ctx.dispatcher.ensure_job(state, "finalize", spec).await? {
            EnsureOutcome::Suspend { interrupt, .. } => Ok(StageOutcome::Suspend(interrupt)),
            EnsureOutcome::Ready(_) => {
                project.status = ProjectStatus::Complete;
                self.save_project(project).await?;
                info!(project_id = %state.project_id, "pipeline complete");
                Ok(StageOutcome::Advance(None))
            }
        }
    }

    fn scene_video_spec(&self, scene: &Scene, forced: bool) -> JobSpec {
        let spec = JobSpec::new(
            JobType::GenerateSceneVideo,
            scene.id.as_str(),
            Some(AssetKind::SceneVideo),
            json!({
                "sceneId": scene.id,
                "description": scene.description,
                "characterIds": scene.character_ids,
                "locationId": scene.location_id,
                "startFrame": scene
                    .assets
                    .best_version(AssetKind::SceneStartFrame)
                    .map(|v| v.data.clone()),
                "endFrame": scene
                    .assets
                    .best_version(AssetKind::SceneEndFrame)
                    .map(|v| v.data.clone()),
            }),
        );
        if forced {
            spec.forced()
        } else {
            spec
        }
    }

    async fn materialize_entities(
        &self,
        state: &WorkflowState,
        enrichment: &EnrichmentResult,
    ) -> Result<(), WorkflowError> {
        let now = Utc::now();
        let project_id = state.project_id.as_str();

        for character in &enrichment.characters {
            self.ctx
                .project_repo
                .upsert_character(CharacterRecord {
                    id: character.id.clone(),
                    project_id: project_id.to_string(),
                    name: character.name.clone(),
                    description: character.description.clone(),
                    assets: json!({}),
                    created_at: now,
                    updated_at: now,
                })
                .await?;
        }
        for location in &enrichment.locations {
            self.ctx
                .project_repo
                .upsert_location(LocationRecord {
                    id: location.id.clone(),
                    project_id: project_id.to_string(),
                    name: location.name.clone(),
                    description: location.description.clone(),
                    assets: json!({}),
                    created_at: now,
                    updated_at: now,
                })
                .await?;
        }
        for (index, scene) in enrichment.storyboard.scenes.iter().enumerate() {
            self.ctx
                .project_repo
                .upsert_scene(SceneRecord {
                    id: scene.id.as_str().to_string(),
                    project_id: project_id.to_string(),
                    scene_index: index as i32,
                    title: scene.title.clone(),
                    description: scene.description.clone(),
                    start_time_seconds: None,
                    end_time_seconds: scene.duration_seconds,
                    location_id: scene.location.as_ref().map(|id| id.as_str().to_string()),
                    assets: json!({}),
                    character_ids: scene
                        .characters
                        .iter()
                        .map(|id| id.as_str().to_string())
                        .collect(),
                    created_at: now,
                    updated_at: now,
                })
                .await?;
        }
        Ok(())
    }

    async fn load_project(&self, state: &WorkflowState) -> Result<Project, WorkflowError> {
        let record = self
            .ctx
            .project_repo
            .get(state.project_id.as_str())
            .await?
            .ok_or_else(|| WorkflowError::ProjectNotFound(state.project_id.clone()))?;
        Project::try_from(record).map_err(WorkflowError::InvalidState)
    }

    async fn save_project(&self, project: Project) -> Result<(), WorkflowError> {
        let project_id = project.id.clone();
        let record = cineforge_service_base::repo::project::ProjectRecord::try_from(project)
            .map_err(WorkflowError::InvalidState)?;
        let updated = self.ctx.project_repo.update(record).await?;
        if !updated {
            return Err(WorkflowError::ProjectNotFound(project_id));
        }
        Ok(())
    }

    async fn load_scenes(&self, state: &WorkflowState) -> Result<Vec<Scene>, WorkflowError> {
        let records = self
            .ctx
            .project_repo
            .get_scenes(state.project_id.as_str())
            .await?;
        records
            .into_iter()
            .map(|record| Scene::try_from(record).map_err(WorkflowError::InvalidState))
            .collect()
    }

    async fn best_data(
        &self,
        state: &WorkflowState,
        kind: AssetKind,
    ) -> Result<Option<String>, WorkflowError> {
        use cineforge_common::model::AssetScope;
        let best = self
            .ctx
            .asset_manager
            .best_version(&AssetScope::Project(state.project_id.clone()), kind)
            .await?;
        Ok(best.map(|version| version.data))
    }
}

fn audio_uri(project: &Project) -> Option<String> {
    project
        .metadata
        .get("audioGcsUri")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn clear_force_flag(project: &mut Project, scene_id: &SceneId) {
    project.force_regenerate_scene_ids.retain(|id| id != scene_id);
}
