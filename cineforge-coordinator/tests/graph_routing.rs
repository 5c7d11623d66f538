use test_r::test;

use crate::TestHarness;
use assert2::check;
use cineforge_common::config::PipelineConfig;
use cineforge_common::model::{
    AssetKind, AssetMetadata, AssetScope, AssetType, InterruptType, ProjectId, SceneId,
};
use cineforge_coordinator::workflow::graph::RunOutcome;
use cineforge_coordinator::workflow::stage::Stage;
use cineforge_coordinator::workflow::state::WorkflowState;
use cineforge_service_base::repo::project::{ProjectRepo, SceneRecord};
use cineforge_service_base::service::asset::{AssetManager, NewAssetVersion};
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn add_scene(harness: &TestHarness, scene_id: &str, index: i32) {
    let now = Utc::now();
    harness
        .project_repo
        .upsert_scene(SceneRecord {
            id: scene_id.to_string(),
            project_id: harness.project_id.as_str().to_string(),
            scene_index: index,
            title: format!("Scene {index}"),
            description: "a scene".to_string(),
            start_time_seconds: None,
            end_time_seconds: None,
            location_id: None,
            assets: json!({}),
            character_ids: vec![],
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
}

async fn set_storyboard(harness: &TestHarness, with_rules: bool) {
    let mut record = harness
        .project_repo
        .get(harness.project_id.as_str())
        .await
        .unwrap()
        .unwrap();
    record.storyboard = Some(json!({
        "title": "Cube",
        "scenes": [
            { "id": "S1", "title": "One", "description": "first" },
        ],
    }));
    if with_rules {
        record.generation_rules = vec!["no text overlays".to_string()];
    }
    harness.project_repo.update(record).await.unwrap();
}

async fn run_to_outcome(harness: &TestHarness, state: &mut WorkflowState) -> RunOutcome {
    let graph = harness.graph(PipelineConfig::default());
    graph.run(state, &CancellationToken::new()).await.unwrap()
}

#[test]
async fn fresh_project_routes_to_prompt_expansion() {
    let harness = TestHarness::new("P1").await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    let outcome = run_to_outcome(&harness, &mut state).await;
    check!(matches!(outcome, RunOutcome::Suspended(_)));
    check!(state.current_stage == Some(Stage::ExpandCreativePrompt));

    let jobs = harness.latest_created_jobs().await;
    check!(jobs.len() == 1);
    check!(jobs[0].job_type == cineforge_common::model::JobType::ExpandCreativePrompt);
}

#[test]
async fn storyboard_with_rules_routes_to_character_assets() {
    let harness = TestHarness::new("P1").await;
    set_storyboard(&harness, true).await;
    add_scene(&harness, "S1", 0).await;

    let mut state = WorkflowState::new(harness.project_id.clone());
    let outcome = run_to_outcome(&harness, &mut state).await;

    // No characters or locations exist, so the asset stages fall through
    // and the run parks on the scene-frame fan-out.
    check!(matches!(outcome, RunOutcome::Suspended(_)));
    check!(state.current_stage == Some(Stage::GenerateSceneAssets));
    // The router entered past the analysis stages.
    check!(!state.node_attempts.contains_key("semantic_analysis"));
    check!(!state.node_attempts.contains_key("expand_creative_prompt"));
}

#[test]
async fn storyboard_without_rules_routes_to_semantic_analysis() {
    let harness = TestHarness::new("P1").await;
    set_storyboard(&harness, false).await;

    let mut state = WorkflowState::new(harness.project_id.clone());
    let outcome = run_to_outcome(&harness, &mut state).await;
    check!(matches!(outcome, RunOutcome::Suspended(_)));
    check!(state.current_stage == Some(Stage::SemanticAnalysis));
}

#[test]
async fn enhanced_prompt_routes_to_enrichment() {
    let harness = TestHarness::new("P1").await;
    harness
        .asset_manager
        .create_versioned_assets(
            &AssetScope::Project(harness.project_id.clone()),
            AssetKind::EnhancedPrompt,
            vec![NewAssetVersion {
                data: "an enhanced prompt".to_string(),
                asset_type: AssetType::Text,
                metadata: AssetMetadata::default(),
            }],
            true,
        )
        .await
        .unwrap();

    let mut state = WorkflowState::new(harness.project_id.clone());
    let outcome = run_to_outcome(&harness, &mut state).await;
    check!(matches!(outcome, RunOutcome::Suspended(_)));
    check!(state.current_stage == Some(Stage::EnrichStoryboardAndScenes));

    let jobs = harness.latest_created_jobs().await;
    check!(jobs.len() == 1);
    check!(jobs[0].job_type == cineforge_common::model::JobType::EnhanceStoryboard);
}

#[test]
async fn scene_with_best_video_routes_to_process_scene() {
    let harness = TestHarness::new("P1").await;
    add_scene(&harness, "S1", 0).await;
    add_scene(&harness, "S2", 1).await;
    harness
        .asset_manager
        .create_versioned_assets(
            &AssetScope::Scene(SceneId::from("S1")),
            AssetKind::SceneVideo,
            vec![NewAssetVersion {
                data: "gs://b/s1.mp4".to_string(),
                asset_type: AssetType::Video,
                metadata: AssetMetadata::default(),
            }],
            true,
        )
        .await
        .unwrap();

    let mut state = WorkflowState::new(harness.project_id.clone());
    let outcome = run_to_outcome(&harness, &mut state).await;
    check!(matches!(outcome, RunOutcome::Suspended(_)));
    check!(state.current_stage == Some(Stage::ProcessScene));

    // Only S2 needs a video.
    let jobs = harness.latest_created_jobs().await;
    check!(jobs.len() == 1);
    check!(jobs[0].unique_key.as_deref() == Some("S2"));
}

#[test]
async fn parallel_mode_fans_scene_videos_out_to_the_slot_limit() {
    let harness = TestHarness::new("P1").await;
    add_scene(&harness, "S1", 0).await;
    add_scene(&harness, "S2", 1).await;
    add_scene(&harness, "S3", 2).await;

    let pipeline = PipelineConfig {
        execution_mode: cineforge_common::model::ExecutionMode::Parallel,
        max_parallel_jobs: 2,
        ..PipelineConfig::default()
    };
    let mut state = WorkflowState::new(harness.project_id.clone());
    state.current_stage = Some(Stage::ProcessScene);
    let graph = harness.graph(pipeline);
    let outcome = graph.run(&mut state, &CancellationToken::new()).await.unwrap();

    match outcome {
        RunOutcome::Suspended(interrupt) => {
            check!(interrupt.interrupt_type == InterruptType::WaitingForBatch);
            check!(interrupt.error_details["remaining"] == serde_json::json!(3));
        }
        other => panic!("expected suspension, got {other:?}"),
    }
    // Two of three scene videos are in flight, capped by the slot limit.
    check!(harness.latest_created_jobs().await.len() == 2);
}

#[test]
async fn complete_project_has_no_next_step() {
    let harness = TestHarness::new("P1").await;
    let mut record = harness
        .project_repo
        .get(harness.project_id.as_str())
        .await
        .unwrap()
        .unwrap();
    record.status = "complete".to_string();
    harness.project_repo.update(record).await.unwrap();

    let mut state = WorkflowState::new(harness.project_id.clone());
    let outcome = run_to_outcome(&harness, &mut state).await;
    check!(matches!(outcome, RunOutcome::NoNextStep));
}

#[test]
async fn duplicate_resume_is_idempotent() {
    let harness = TestHarness::new("P1").await;
    add_scene(&harness, "S1", 0).await;

    let mut state = WorkflowState::new(harness.project_id.clone());
    let first = run_to_outcome(&harness, &mut state).await;
    check!(matches!(first, RunOutcome::Suspended(_)));
    let jobs_after_first = harness.job_service.list_jobs(&harness.project_id).await.unwrap();
    let stage_after_first = state.current_stage;

    // A duplicate JOB_COMPLETED delivery re-runs the graph from the same
    // checkpoint: same stage, same job set, no new rows.
    let second = run_to_outcome(&harness, &mut state).await;
    check!(matches!(second, RunOutcome::Suspended(_)));
    check!(state.current_stage == stage_after_first);
    let jobs_after_second = harness.job_service.list_jobs(&harness.project_id).await.unwrap();
    check!(jobs_after_second.len() == jobs_after_first.len());
}

#[test]
async fn exhausted_retries_become_an_intervention_interrupt() {
    let harness = TestHarness::new("P1").await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    // Park on expand_creative_prompt, then burn the job's retry budget.
    run_to_outcome(&harness, &mut state).await;
    let job_id = state.job_ids[0];
    harness.fail_job(&job_id, "safety rejection").await;

    let outcome = run_to_outcome(&harness, &mut state).await;
    match outcome {
        RunOutcome::Suspended(interrupt) => {
            check!(interrupt.interrupt_type == InterruptType::LlmRetryExhausted);
            check!(interrupt.node_name == "expand_creative_prompt");
            check!(interrupt.error.is_some());
        }
        other => panic!("expected suspension, got {other:?}"),
    }
    check!(state.interrupt.is_some());
    check!(!state.interrupt_resolved);

    // The workflow stays parked until the operator resolves it.
    let again = run_to_outcome(&harness, &mut state).await;
    check!(matches!(again, RunOutcome::Suspended(_)));

    let checkpoint = harness
        .checkpointer
        .load_latest(&ProjectId::from("P1"))
        .await
        .unwrap()
        .unwrap();
    check!(checkpoint.interrupt.is_some());
}
