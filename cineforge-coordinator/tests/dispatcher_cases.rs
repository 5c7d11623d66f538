use test_r::test;

use crate::TestHarness;
use assert2::check;
use cineforge_common::config::PipelineConfig;
use cineforge_common::model::{AssetKind, InterruptType, JobState, JobType};
use cineforge_coordinator::workflow::dispatcher::{BatchOutcome, EnsureOutcome, JobSpec};
use cineforge_coordinator::workflow::state::WorkflowState;
use cineforge_coordinator::workflow::WorkflowError;
use serde_json::json;

fn spec(unique_key: &str) -> JobSpec {
    JobSpec::new(
        JobType::GenerateSceneVideo,
        unique_key,
        Some(AssetKind::SceneVideo),
        json!({ "sceneId": unique_key }),
    )
}

#[test]
async fn missing_job_is_created_and_suspends() {
    let harness = TestHarness::new("P1").await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    let outcome = harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();

    match outcome {
        EnsureOutcome::Suspend { interrupt, created } => {
            check!(created);
            check!(interrupt.interrupt_type == InterruptType::WaitingForJob);
            check!(interrupt.node_name == "process_scene");
        }
        other => panic!("expected suspend, got {other:?}"),
    }
    let jobs = harness.latest_created_jobs().await;
    check!(jobs.len() == 1);
    check!(jobs[0].unique_key.as_deref() == Some("S1"));
    check!(state.job_ids.len() == 1);
}

#[test]
async fn completed_job_returns_its_result() {
    let harness = TestHarness::new("P1").await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();
    let job_id = state.job_ids[0];
    harness.complete_job(&job_id, json!({ "videoUri": "gs://b/s1.mp4" })).await;

    let outcome = harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();
    match outcome {
        EnsureOutcome::Ready(result) => {
            check!(result["videoUri"] == json!("gs://b/s1.mp4"));
        }
        other => panic!("expected ready, got {other:?}"),
    }
}

#[test]
async fn active_job_suspends_without_creating() {
    let harness = TestHarness::new("P1").await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();

    // Second call observes the CREATED row.
    let outcome = harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();
    match outcome {
        EnsureOutcome::Suspend { created, .. } => check!(!created),
        other => panic!("expected suspend, got {other:?}"),
    }
    let jobs = harness.job_service.list_jobs(&harness.project_id).await.unwrap();
    check!(jobs.len() == 1);
}

#[test]
async fn failed_within_budget_is_requeued() {
    let pipeline = PipelineConfig {
        max_retries: 3,
        ..PipelineConfig::default()
    };
    let harness = TestHarness::with_pipeline("P1", pipeline).await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();
    let job_id = state.job_ids[0];
    harness.fail_job(&job_id, "transient").await;

    let outcome = harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();
    check!(matches!(outcome, EnsureOutcome::Suspend { created: false, .. }));

    let job = harness.job_service.get_job(&job_id).await.unwrap().unwrap();
    check!(job.state == JobState::Created);
}

#[test]
async fn exhausted_job_raises_retries_exhausted() {
    let harness = TestHarness::new("P1").await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();
    let job_id = state.job_ids[0];
    // Default max_retries is 2: one failure moves attempt to 2 == budget.
    harness.fail_job(&job_id, "model exploded").await;
    let job = harness.job_service.get_job(&job_id).await.unwrap().unwrap();
    check!(job.state == JobState::Fatal);

    let error = harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap_err();
    match error {
        WorkflowError::RetriesExhausted {
            node_name,
            unique_key,
            ..
        } => {
            check!(node_name == "process_scene");
            check!(unique_key == "S1");
        }
        other => panic!("expected retries exhausted, got {other:?}"),
    }
}

#[test]
async fn forced_spec_supersedes_completed_row() {
    let harness = TestHarness::new("P1").await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();
    harness
        .complete_job(&state.job_ids[0], json!({ "videoUri": "gs://b/v1.mp4" }))
        .await;

    let outcome = harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1").forced())
        .await
        .unwrap();
    check!(matches!(outcome, EnsureOutcome::Suspend { created: true, .. }));

    let jobs = harness.job_service.list_jobs(&harness.project_id).await.unwrap();
    check!(jobs.len() == 2);
}

#[test]
async fn retry_node_gets_a_fresh_row_with_revised_params() {
    let harness = TestHarness::new("P1").await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();
    let first_job = state.job_ids[0];
    harness.fail_job(&first_job, "bad prompt").await;
    let job = harness.job_service.get_job(&first_job).await.unwrap().unwrap();
    check!(job.state == JobState::Fatal);

    // Operator resolution: retry with revised params.
    state.retry_nodes.insert("S1".to_string());
    state.revised_params = Some(json!({ "prompt": "a calmer cube" }));

    let outcome = harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();
    check!(matches!(outcome, EnsureOutcome::Suspend { created: true, .. }));
    check!(!state.retry_nodes.contains("S1"));

    let jobs = harness.job_service.list_jobs(&harness.project_id).await.unwrap();
    let fresh = jobs.iter().find(|job| job.state == JobState::Created).unwrap();
    check!(fresh.payload["prompt"] == json!("a calmer cube"));
    check!(fresh.payload["sceneId"] == json!("S1"));
    check!(fresh.attempt == 1);
}

#[test]
async fn skipped_node_reads_as_ready_null() {
    let harness = TestHarness::new("P1").await;
    let mut state = WorkflowState::new(harness.project_id.clone());
    state.skipped_nodes.insert("S1".to_string());

    let outcome = harness
        .dispatcher
        .ensure_job(&mut state, "process_scene", spec("S1"))
        .await
        .unwrap();
    check!(matches!(outcome, EnsureOutcome::Ready(serde_json::Value::Null)));
    check!(harness.job_service.list_jobs(&harness.project_id).await.unwrap().is_empty());
}

#[test]
async fn batch_respects_the_parallel_slot_limit() {
    let pipeline = PipelineConfig {
        max_parallel_jobs: 2,
        ..PipelineConfig::default()
    };
    let harness = TestHarness::with_pipeline("P1", pipeline).await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    let specs = vec![spec("S1"), spec("S2"), spec("S3"), spec("S4")];
    let outcome = harness
        .dispatcher
        .ensure_batch_jobs(&mut state, "process_scene", specs)
        .await
        .unwrap();

    match outcome {
        BatchOutcome::Suspend { interrupt, created } => {
            check!(interrupt.interrupt_type == InterruptType::WaitingForBatch);
            check!(created.len() == 2);
            check!(interrupt.error_details["remaining"] == serde_json::json!(4));
        }
        other => panic!("expected suspend, got {other:?}"),
    }
    check!(harness.latest_created_jobs().await.len() == 2);
}

#[test]
async fn batch_ready_preserves_spec_order() {
    let harness = TestHarness::new("P1").await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    // Start and finish both units (default max_parallel_jobs is 2).
    harness
        .dispatcher
        .ensure_batch_jobs(&mut state, "process_scene", vec![spec("S1"), spec("S2")])
        .await
        .unwrap();
    let jobs = harness.job_service.list_jobs(&harness.project_id).await.unwrap();
    for job in &jobs {
        let key = job.unique_key.clone().unwrap();
        harness.complete_job(&job.id, json!({ "videoUri": format!("gs://b/{key}.mp4") })).await;
    }

    let outcome = harness
        .dispatcher
        .ensure_batch_jobs(&mut state, "process_scene", vec![spec("S1"), spec("S2")])
        .await
        .unwrap();
    match outcome {
        BatchOutcome::Ready(results) => {
            check!(results[0]["videoUri"] == json!("gs://b/S1.mp4"));
            check!(results[1]["videoUri"] == json!("gs://b/S2.mp4"));
        }
        other => panic!("expected ready, got {other:?}"),
    }
}

#[test]
async fn batch_with_exhausted_unit_stops_new_work() {
    let harness = TestHarness::new("P1").await;
    let mut state = WorkflowState::new(harness.project_id.clone());

    harness
        .dispatcher
        .ensure_batch_jobs(&mut state, "process_scene", vec![spec("S1"), spec("S2")])
        .await
        .unwrap();
    let jobs = harness.job_service.list_jobs(&harness.project_id).await.unwrap();
    let s1 = jobs.iter().find(|j| j.unique_key.as_deref() == Some("S1")).unwrap();
    harness.fail_job(&s1.id, "model exploded").await;
    let fatal = harness.job_service.get_job(&s1.id).await.unwrap().unwrap();
    check!(fatal.state == JobState::Fatal);

    let error = harness
        .dispatcher
        .ensure_batch_jobs(
            &mut state,
            "process_scene",
            vec![spec("S1"), spec("S2"), spec("S3")],
        )
        .await
        .unwrap_err();
    match error {
        WorkflowError::BatchRetriesExhausted { node_name, failures } => {
            check!(node_name == "process_scene");
            check!(failures.len() == 1);
            check!(failures[0].unique_key == "S1");
        }
        other => panic!("expected batch retries exhausted, got {other:?}"),
    }
    // No new job was started for S3.
    let jobs = harness.job_service.list_jobs(&harness.project_id).await.unwrap();
    check!(!jobs.iter().any(|j| j.unique_key.as_deref() == Some("S3")));
}
