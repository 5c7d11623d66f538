use test_r::test;

use crate::WorkerHarness;
use assert2::check;
use cineforge_common::model::{AssetKind, AssetScope, JobState, JobType, SceneId};
use cineforge_service_base::service::asset::AssetManager;
use cineforge_service_base::service::job::CreateJob;
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn create_and_process(
    harness: &WorkerHarness,
    job_type: JobType,
    unique_key: &str,
    asset_key: Option<AssetKind>,
    payload: serde_json::Value,
) -> cineforge_common::model::Job {
    let job = harness
        .job_service
        .create_job(CreateJob {
            job_type,
            project_id: harness.project_id.clone(),
            payload,
            unique_key: Some(unique_key.to_string()),
            asset_key,
            max_retries: Some(3),
        })
        .await
        .unwrap();
    harness
        .services
        .worker
        .process_one(&job.id, CancellationToken::new())
        .await;
    harness.job_service.get_job(&job.id).await.unwrap().unwrap()
}

#[test]
async fn expand_prompt_writes_the_enhanced_prompt_asset() {
    let harness = WorkerHarness::new("P1").await;
    let job = create_and_process(
        &harness,
        JobType::ExpandCreativePrompt,
        "expand_creative_prompt",
        Some(AssetKind::EnhancedPrompt),
        json!({ "initialPrompt": "A red cube rotates" }),
    )
    .await;

    check!(job.state == JobState::Completed);
    let result = job.result.unwrap();
    check!(result["enhancedPrompt"].as_str().unwrap().contains("A red cube rotates"));

    let best = harness
        .asset_manager
        .best_version(
            &AssetScope::Project(harness.project_id.clone()),
            AssetKind::EnhancedPrompt,
        )
        .await
        .unwrap()
        .unwrap();
    check!(best.version == 1);
    check!(best.metadata.job_id == Some(job.id));
}

#[test]
async fn scene_video_lands_on_the_scene_registry() {
    let harness = WorkerHarness::new("P1").await;
    harness.add_scene("S1", 0).await;

    let job = create_and_process(
        &harness,
        JobType::GenerateSceneVideo,
        "S1",
        Some(AssetKind::SceneVideo),
        json!({ "sceneId": "S1", "description": "a quiet interior" }),
    )
    .await;

    check!(job.state == JobState::Completed);
    let best = harness
        .asset_manager
        .best_version(&AssetScope::Scene(SceneId::from("S1")), AssetKind::SceneVideo)
        .await
        .unwrap()
        .unwrap();
    check!(best.data.starts_with("stub://videos/"));
    check!(best.version == 1);

    // Regeneration appends version 2 and moves best.
    let job2 = harness
        .job_service
        .create_job(CreateJob {
            job_type: JobType::GenerateSceneVideo,
            project_id: harness.project_id.clone(),
            payload: json!({ "sceneId": "S1", "description": "a louder interior" }),
            unique_key: Some("S1".to_string()),
            asset_key: Some(AssetKind::SceneVideo),
            max_retries: Some(3),
        })
        .await
        .unwrap();
    harness
        .services
        .worker
        .process_one(&job2.id, CancellationToken::new())
        .await;

    let best = harness
        .asset_manager
        .best_version(&AssetScope::Scene(SceneId::from("S1")), AssetKind::SceneVideo)
        .await
        .unwrap()
        .unwrap();
    check!(best.version == 2);
}

#[test]
async fn safety_rejection_is_sanitized_and_retried() {
    let harness = WorkerHarness::new("P1").await;
    harness.add_scene("S1", 0).await;

    // The stub client rejects prompts containing "unsafe"; the worker's
    // sanitize pass strips the word and the retry succeeds.
    let job = create_and_process(
        &harness,
        JobType::GenerateSceneVideo,
        "S1",
        Some(AssetKind::SceneVideo),
        json!({ "sceneId": "S1", "description": "an unsafe but otherwise fine scene" }),
    )
    .await;

    check!(job.state == JobState::Completed);
}

#[test]
async fn validation_failure_is_fatal_without_retry() {
    let harness = WorkerHarness::new("P1").await;

    // Missing `initialPrompt`.
    let job = create_and_process(
        &harness,
        JobType::ExpandCreativePrompt,
        "expand_creative_prompt",
        Some(AssetKind::EnhancedPrompt),
        json!({}),
    )
    .await;

    check!(job.state == JobState::Fatal);
    check!(job.error.unwrap().contains("initialPrompt"));
}

#[test]
async fn second_claim_of_the_same_job_is_a_noop() {
    let harness = WorkerHarness::new("P1").await;
    let job = harness
        .job_service
        .create_job(CreateJob {
            job_type: JobType::ExpandCreativePrompt,
            project_id: harness.project_id.clone(),
            payload: json!({ "initialPrompt": "A red cube rotates" }),
            unique_key: Some("expand_creative_prompt".to_string()),
            asset_key: Some(AssetKind::EnhancedPrompt),
            max_retries: Some(3),
        })
        .await
        .unwrap();

    harness
        .services
        .worker
        .process_one(&job.id, CancellationToken::new())
        .await;
    let after_first = harness.job_service.get_job(&job.id).await.unwrap().unwrap();
    check!(after_first.state == JobState::Completed);
    let attempt_after_first = after_first.attempt;

    // A duplicate JOB_DISPATCHED delivery finds nothing to claim.
    harness
        .services
        .worker
        .process_one(&job.id, CancellationToken::new())
        .await;
    let after_second = harness.job_service.get_job(&job.id).await.unwrap().unwrap();
    check!(after_second.state == JobState::Completed);
    check!(after_second.attempt == attempt_after_first);
}

#[test]
async fn render_video_concatenates_scene_videos() {
    let harness = WorkerHarness::new("P1").await;
    let job = create_and_process(
        &harness,
        JobType::RenderVideo,
        "render_video",
        Some(AssetKind::RenderedVideo),
        json!({ "sceneVideos": [
            { "sceneId": "S1", "videoUri": "stub://videos/a.mp4" },
            { "sceneId": "S2", "videoUri": "stub://videos/b.mp4" },
        ]}),
    )
    .await;

    check!(job.state == JobState::Completed);
    let best = harness
        .asset_manager
        .best_version(
            &AssetScope::Project(harness.project_id.clone()),
            AssetKind::RenderedVideo,
        )
        .await
        .unwrap()
        .unwrap();
    check!(best.data.contains("test-bucket"));
}
