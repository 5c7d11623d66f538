//! The stage handlers, keyed by job type. Each one turns a claimed job
//! into asset writes plus a JSON result for the graph.

use crate::handler::{
    job_metadata, optional_str, required_str, AssetWrite, HandlerContext, HandlerError,
    HandlerOutput, JobHandler,
};
use async_trait::async_trait;
use cineforge_common::model::{
    AssetKind, AssetScope, AssetType, CharacterId, Job, JobType, LocationId, SceneId,
    Storyboard, StoryboardScene,
};
use cineforge_service_base::service::asset::NewAssetVersion;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use strum::IntoEnumIterator;

pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// The full production set; covers every job type.
    pub fn standard() -> Self {
        let mut handlers: HashMap<JobType, Arc<dyn JobHandler>> = HashMap::new();
        handlers.insert(JobType::ExpandCreativePrompt, Arc::new(ExpandPromptHandler));
        handlers.insert(JobType::CreateScenesFromAudio, Arc::new(AudioScenesHandler));
        handlers.insert(JobType::GenerateStoryboard, Arc::new(StoryboardHandler));
        handlers.insert(JobType::EnhanceStoryboard, Arc::new(EnhanceStoryboardHandler));
        handlers.insert(JobType::SemanticAnalysis, Arc::new(SemanticAnalysisHandler));
        handlers.insert(
            JobType::GenerateCharacterAssets,
            Arc::new(CharacterImageHandler),
        );
        handlers.insert(
            JobType::GenerateLocationAssets,
            Arc::new(LocationImageHandler),
        );
        handlers.insert(JobType::GenerateSceneFrames, Arc::new(SceneFrameHandler));
        handlers.insert(JobType::FrameRender, Arc::new(FrameRenderHandler));
        handlers.insert(JobType::GenerateSceneVideo, Arc::new(SceneVideoHandler));
        handlers.insert(JobType::RenderVideo, Arc::new(RenderVideoHandler));
        handlers.insert(JobType::Finalize, Arc::new(FinalizeHandler));
        debug_assert!(JobType::iter().all(|job_type| handlers.contains_key(&job_type)));
        Self { handlers }
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }
}

pub struct ExpandPromptHandler;

#[async_trait]
impl JobHandler for ExpandPromptHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        let initial_prompt = required_str(&job.payload, "initialPrompt")?;
        let generated = ctx
            .model_client
            .generate_text(&initial_prompt, &ctx.cancel)
            .await?;
        Ok(
            HandlerOutput::new(json!({ "enhancedPrompt": generated.text })).with_asset(
                AssetWrite {
                    scope: AssetScope::Project(job.project_id.clone()),
                    kind: AssetKind::EnhancedPrompt,
                    versions: vec![NewAssetVersion {
                        data: generated.text.clone(),
                        asset_type: AssetType::Text,
                        metadata: job_metadata(job, Some(generated.model)),
                    }],
                    set_as_best: true,
                },
            ),
        )
    }
}

pub struct AudioScenesHandler;

#[async_trait]
impl JobHandler for AudioScenesHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        let audio_uri = required_str(&job.payload, "audioGcsUri")?;
        let prompt = optional_str(&job.payload, "enhancedPrompt").unwrap_or_default();
        let analysis = ctx
            .model_client
            .generate_json(
                &format!("segment audio {audio_uri} into timed scenes: {prompt}"),
                &ctx.cancel,
            )
            .await?;
        let storyboard = storyboard_from_prompt(&prompt, job.project_id.as_str());
        let result = json!({
            "audioAnalysis": analysis,
            "storyboard": storyboard,
        });
        Ok(HandlerOutput::new(result).with_asset(AssetWrite {
            scope: AssetScope::Project(job.project_id.clone()),
            kind: AssetKind::AudioAnalysis,
            versions: vec![NewAssetVersion {
                data: analysis.to_string(),
                asset_type: AssetType::Json,
                metadata: job_metadata(job, None),
            }],
            set_as_best: true,
        }))
    }
}

pub struct StoryboardHandler;

#[async_trait]
impl JobHandler for StoryboardHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        let prompt = required_str(&job.payload, "enhancedPrompt")?;
        // The structured call is what a provider-backed client would use;
        // the scene skeleton below keeps the shape deterministic.
        let _ = ctx
            .model_client
            .generate_json(&format!("storyboard for: {prompt}"), &ctx.cancel)
            .await?;
        let storyboard = storyboard_from_prompt(&prompt, job.project_id.as_str());
        Ok(
            HandlerOutput::new(json!({ "storyboard": storyboard })).with_asset(AssetWrite {
                scope: AssetScope::Project(job.project_id.clone()),
                kind: AssetKind::Storyboard,
                versions: vec![NewAssetVersion {
                    data: serde_json::to_string(&storyboard)
                        .map_err(|e| HandlerError::Validation(e.to_string()))?,
                    asset_type: AssetType::Json,
                    metadata: job_metadata(job, None),
                }],
                set_as_best: true,
            }),
        )
    }
}

pub struct EnhanceStoryboardHandler;

#[async_trait]
impl JobHandler for EnhanceStoryboardHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        let mut storyboard: Storyboard = match job.payload.get("storyboard") {
            Some(Value::Null) | None => {
                let prompt = required_str(&job.payload, "enhancedPrompt")?;
                storyboard_from_prompt(&prompt, job.project_id.as_str())
            }
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|e| HandlerError::Validation(format!("bad storyboard: {e}")))?,
        };

        let narrator = CharacterId::from(format!("{}-char-1", job.project_id).as_str());
        let stage_location = LocationId::from(format!("{}-loc-1", job.project_id).as_str());
        for scene in &mut storyboard.scenes {
            let enriched = ctx
                .model_client
                .generate_text(&scene.description, &ctx.cancel)
                .await?;
            scene.description = enriched.text;
            if scene.characters.is_empty() {
                scene.characters.push(narrator.clone());
            }
            if scene.location.is_none() {
                scene.location = Some(stage_location.clone());
            }
        }

        let result = json!({
            "storyboard": storyboard,
            "characters": [{
                "id": narrator,
                "name": "Narrator",
                "description": "primary on-screen presence",
            }],
            "locations": [{
                "id": stage_location,
                "name": "Main set",
                "description": "default location derived from the prompt",
            }],
        });
        Ok(HandlerOutput::new(result).with_asset(AssetWrite {
            scope: AssetScope::Project(job.project_id.clone()),
            kind: AssetKind::Storyboard,
            versions: vec![NewAssetVersion {
                data: serde_json::to_string(&storyboard)
                    .map_err(|e| HandlerError::Validation(e.to_string()))?,
                asset_type: AssetType::Json,
                metadata: job_metadata(job, None),
            }],
            set_as_best: true,
        }))
    }
}

pub struct SemanticAnalysisHandler;

#[async_trait]
impl JobHandler for SemanticAnalysisHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        let storyboard = job
            .payload
            .get("storyboard")
            .cloned()
            .unwrap_or(Value::Null);
        // The structured call is kept for its safety/validation errors;
        // the deterministic rule set below stands in for its result.
        let _ = ctx
            .model_client
            .generate_json(&format!("derive generation rules for {storyboard}"), &ctx.cancel)
            .await?;
        Ok(HandlerOutput::new(json!({
            "generationRules": [
                "maintain consistent lighting across scenes",
                "keep character appearance stable",
            ],
        })))
    }
}

pub struct CharacterImageHandler;

#[async_trait]
impl JobHandler for CharacterImageHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        let character_id = required_str(&job.payload, "characterId")?;
        let description = optional_str(&job.payload, "description").unwrap_or_default();
        let media = ctx
            .model_client
            .generate_image(&format!("reference portrait: {description}"), &ctx.cancel)
            .await?;
        Ok(
            HandlerOutput::new(json!({ "imageUri": media.uri })).with_asset(AssetWrite {
                scope: AssetScope::Character(CharacterId(character_id)),
                kind: AssetKind::CharacterImage,
                versions: vec![NewAssetVersion {
                    data: media.uri.clone(),
                    asset_type: AssetType::Image,
                    metadata: job_metadata(job, Some(media.model)),
                }],
                set_as_best: true,
            }),
        )
    }
}

pub struct LocationImageHandler;

#[async_trait]
impl JobHandler for LocationImageHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        let location_id = required_str(&job.payload, "locationId")?;
        let description = optional_str(&job.payload, "description").unwrap_or_default();
        let media = ctx
            .model_client
            .generate_image(&format!("establishing shot: {description}"), &ctx.cancel)
            .await?;
        Ok(
            HandlerOutput::new(json!({ "imageUri": media.uri })).with_asset(AssetWrite {
                scope: AssetScope::Location(LocationId(location_id)),
                kind: AssetKind::LocationImage,
                versions: vec![NewAssetVersion {
                    data: media.uri.clone(),
                    asset_type: AssetType::Image,
                    metadata: job_metadata(job, Some(media.model)),
                }],
                set_as_best: true,
            }),
        )
    }
}

pub struct SceneFrameHandler;

#[async_trait]
impl JobHandler for SceneFrameHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        frame_for_scene(ctx, job, None).await
    }
}

/// Out-of-graph frame regeneration; same output shape as the in-graph
/// frame jobs, but the prompt modification comes from the operator.
pub struct FrameRenderHandler;

#[async_trait]
impl JobHandler for FrameRenderHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        let modification = optional_str(&job.payload, "promptModification");
        frame_for_scene(ctx, job, modification).await
    }
}

pub struct SceneVideoHandler;

#[async_trait]
impl JobHandler for SceneVideoHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        let scene_id = required_str(&job.payload, "sceneId")?;
        let description = optional_str(&job.payload, "description").unwrap_or_default();
        let modification = optional_str(&job.payload, "promptModification");
        let prompt = match modification {
            Some(modification) => format!("{description}; {modification}"),
            None => description,
        };
        let start_frame = optional_str(&job.payload, "startFrame");
        let end_frame = optional_str(&job.payload, "endFrame");
        let media = ctx
            .model_client
            .generate_video(
                &prompt,
                start_frame.as_deref(),
                end_frame.as_deref(),
                &ctx.cancel,
            )
            .await?;
        Ok(
            HandlerOutput::new(json!({ "videoUri": media.uri, "sceneId": scene_id }))
                .with_asset(AssetWrite {
                    scope: AssetScope::Scene(SceneId(scene_id)),
                    kind: AssetKind::SceneVideo,
                    versions: vec![NewAssetVersion {
                        data: media.uri.clone(),
                        asset_type: AssetType::Video,
                        metadata: job_metadata(job, Some(media.model)),
                    }],
                    set_as_best: true,
                }),
        )
    }
}

pub struct RenderVideoHandler;

#[async_trait]
impl JobHandler for RenderVideoHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        let scene_videos = job
            .payload
            .get("sceneVideos")
            .and_then(Value::as_array)
            .ok_or_else(|| HandlerError::Validation("payload is missing `sceneVideos`".into()))?;
        let inputs: Vec<String> = scene_videos
            .iter()
            .filter_map(|entry| entry.get("videoUri").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        if inputs.is_empty() {
            return Err(HandlerError::Validation("no scene videos to render".into()));
        }
        let uri = ctx
            .media_store
            .concatenate(&inputs, &format!("renders/{}.mp4", job.project_id))
            .await?;
        Ok(
            HandlerOutput::new(json!({ "videoUri": uri })).with_asset(AssetWrite {
                scope: AssetScope::Project(job.project_id.clone()),
                kind: AssetKind::RenderedVideo,
                versions: vec![NewAssetVersion {
                    data: uri.clone(),
                    asset_type: AssetType::Video,
                    metadata: job_metadata(job, None),
                }],
                set_as_best: true,
            }),
        )
    }
}

pub struct FinalizeHandler;

#[async_trait]
impl JobHandler for FinalizeHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        job: &Job,
    ) -> Result<HandlerOutput, HandlerError> {
        let rendered = required_str(&job.payload, "renderedVideo")?;
        let uri = ctx
            .media_store
            .store(&format!("final/{}.mp4", job.project_id), "video/mp4")
            .await?;
        Ok(
            HandlerOutput::new(json!({ "finalUri": uri, "source": rendered })).with_asset(
                AssetWrite {
                    scope: AssetScope::Project(job.project_id.clone()),
                    kind: AssetKind::FinalOutput,
                    versions: vec![NewAssetVersion {
                        data: uri.clone(),
                        asset_type: AssetType::Video,
                        metadata: job_metadata(job, None),
                    }],
                    set_as_best: true,
                },
            ),
        )
    }
}

async fn frame_for_scene(
    ctx: &HandlerContext,
    job: &Job,
    modification: Option<String>,
) -> Result<HandlerOutput, HandlerError> {
    let scene_id = required_str(&job.payload, "sceneId")?;
    let frame = required_str(&job.payload, "frame")?;
    let kind = match frame.as_str() {
        "start" => AssetKind::SceneStartFrame,
        "end" => AssetKind::SceneEndFrame,
        other => {
            return Err(HandlerError::Validation(format!("bad frame position: {other}")));
        }
    };
    let description = match optional_str(&job.payload, "description") {
        Some(description) => description,
        None => {
            // Regeneration payloads carry no description; read the scene.
            let scene = ctx
                .project_repo
                .get_scene(&scene_id)
                .await
                .map_err(|e| HandlerError::Transient(e.to_string()))?
                .ok_or_else(|| {
                    HandlerError::Validation(format!("scene not found: {scene_id}"))
                })?;
            scene.description
        }
    };
    let prompt = match &modification {
        Some(modification) => format!("{description}; {modification}"),
        None => description,
    };
    let media = ctx
        .model_client
        .generate_image(&format!("{frame} frame: {prompt}"), &ctx.cancel)
        .await?;
    Ok(
        HandlerOutput::new(json!({ "imageUri": media.uri, "frame": frame })).with_asset(
            AssetWrite {
                scope: AssetScope::Scene(SceneId(scene_id)),
                kind,
                versions: vec![NewAssetVersion {
                    data: media.uri.clone(),
                    asset_type: AssetType::Image,
                    metadata: job_metadata(job, Some(media.model)),
                }],
                set_as_best: true,
            },
        ),
    )
}

/// Deterministic two-scene skeleton used wherever a storyboard has to be
/// synthesized from a prompt.
fn storyboard_from_prompt(prompt: &str, project_id: &str) -> Storyboard {
    Storyboard {
        title: Some(prompt.chars().take(48).collect()),
        scenes: vec![
            StoryboardScene {
                id: SceneId(format!("{project_id}-scene-1")),
                title: "Opening".to_string(),
                description: format!("Opening shot: {prompt}"),
                duration_seconds: Some(4.0),
                characters: vec![],
                location: None,
            },
            StoryboardScene {
                id: SceneId(format!("{project_id}-scene-2")),
                title: "Resolution".to_string(),
                description: format!("Closing shot: {prompt}"),
                duration_seconds: Some(4.0),
                characters: vec![],
                location: None,
            },
        ],
    }
}
