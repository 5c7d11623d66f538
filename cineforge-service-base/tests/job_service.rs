use test_r::test;

use crate::job_service_with_bus;
use assert2::check;
use cineforge_common::model::{AssetKind, JobState, JobType, ProjectId, RequeueContext};
use cineforge_service_base::events::{AttributeFilter, EventBus};
use cineforge_service_base::service::job::{CreateJob, JobServiceError, JobUpdate};
use serde_json::json;

fn create_request(project_id: &ProjectId, unique_key: &str) -> CreateJob {
    CreateJob {
        job_type: JobType::GenerateSceneVideo,
        project_id: project_id.clone(),
        payload: json!({ "sceneId": unique_key }),
        unique_key: Some(unique_key.to_string()),
        asset_key: Some(AssetKind::SceneVideo),
        max_retries: Some(3),
    }
}

#[test]
async fn create_job_starts_in_created_and_dispatches() {
    let (service, bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");
    let mut dispatched = bus
        .subscribe("job-events", AttributeFilter::event_type_in(&["JOB_DISPATCHED"]))
        .await
        .unwrap();

    let job = service.create_job(create_request(&project_id, "S1")).await.unwrap();
    check!(job.state == JobState::Created);
    check!(job.attempt == 1);

    let delivery = dispatched.next().await.unwrap();
    check!(delivery.envelope.event_type() == Some("JOB_DISPATCHED"));
    check!(delivery.envelope.payload["job_id"] == json!(job.id.0.to_string()));
}

#[test]
async fn single_active_job_per_logical_address() {
    let (service, _bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");

    service.create_job(create_request(&project_id, "S1")).await.unwrap();
    let second = service.create_job(create_request(&project_id, "S1")).await;
    check!(matches!(second, Err(JobServiceError::AlreadyActive(_))));

    // A different unique key is a different logical address.
    service.create_job(create_request(&project_id, "S2")).await.unwrap();
}

#[test]
async fn concurrent_creates_admit_exactly_one() {
    let (service, _bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        let project_id = project_id.clone();
        handles.push(tokio::spawn(async move {
            service.create_job(create_request(&project_id, "S1")).await
        }));
    }
    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }
    check!(successes == 1);
}

#[test]
async fn claim_is_exclusive_per_job() {
    let (service, _bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");
    let job = service.create_job(create_request(&project_id, "S1")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        let job_id = job.id;
        handles.push(tokio::spawn(async move { service.claim_job(&job_id).await }));
    }
    let mut claims = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_some() {
            claims += 1;
        }
    }
    check!(claims == 1);

    let claimed = service.get_job(&job.id).await.unwrap().unwrap();
    check!(claimed.state == JobState::Running);
}

#[test]
async fn running_cap_throttles_claims() {
    let (service, _bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");

    // Default cap is 10; create a few more than that.
    let mut job_ids = Vec::new();
    for index in 0..13 {
        let job = service
            .create_job(create_request(&project_id, &format!("S{index}")))
            .await
            .unwrap();
        job_ids.push(job.id);
    }

    let mut claimed = 0;
    for job_id in &job_ids {
        if service.claim_job(job_id).await.unwrap().is_some() {
            claimed += 1;
        }
    }
    check!(claimed == 10);
}

#[test]
async fn attempt_never_decreases() {
    let (service, _bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");
    let job = service.create_job(create_request(&project_id, "S1")).await.unwrap();

    let mut last_attempt = job.attempt;

    service.claim_job(&job.id).await.unwrap().unwrap();
    let failed = service
        .update_job_state(&job.id, JobState::Failed, None, Some("boom".into()))
        .await
        .unwrap()
        .unwrap();
    check!(failed.attempt > last_attempt);
    last_attempt = failed.attempt;

    let requeued = service
        .requeue_job(&job.id, last_attempt, RequeueContext::BackoffRetry)
        .await
        .unwrap()
        .unwrap();
    check!(requeued.attempt > last_attempt);
    last_attempt = requeued.attempt;

    // A stale optimistic update must not touch the row at all.
    let stale = service
        .update_job_safe(&job.id, last_attempt - 1, JobUpdate::default())
        .await
        .unwrap();
    check!(stale.is_none());
    let current = service.get_job(&job.id).await.unwrap().unwrap();
    check!(current.attempt == last_attempt);
}

#[test]
async fn failure_at_retry_budget_is_fatal() {
    let (service, bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");
    let mut failed_events = bus
        .subscribe("job-events", AttributeFilter::event_type_in(&["JOB_FAILED"]))
        .await
        .unwrap();

    let mut request = create_request(&project_id, "S1");
    request.max_retries = Some(2);
    let job = service.create_job(request).await.unwrap();

    // attempt 1 -> 2 on first failure: still FAILED? No: 2 >= 2 is the
    // inclusive boundary, so the row lands on FATAL directly.
    service.claim_job(&job.id).await.unwrap().unwrap();
    let after = service
        .update_job_state(&job.id, JobState::Failed, None, Some("transient".into()))
        .await
        .unwrap()
        .unwrap();
    check!(after.state == JobState::Fatal);
    check!(after.attempt == 2);

    let delivery = failed_events.next().await.unwrap();
    check!(delivery.envelope.event_type() == Some("JOB_FAILED"));
}

#[test]
async fn failure_below_budget_stays_failed() {
    let (service, _bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");
    let job = service.create_job(create_request(&project_id, "S1")).await.unwrap();

    service.claim_job(&job.id).await.unwrap().unwrap();
    let after = service
        .update_job_state(&job.id, JobState::Failed, None, Some("transient".into()))
        .await
        .unwrap()
        .unwrap();
    check!(after.state == JobState::Failed);
    check!(after.attempt == 2);
    check!(after.max_retries == 3);
}

#[test]
async fn requeue_appends_audit_and_redispatches() {
    let (service, bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");
    let job = service.create_job(create_request(&project_id, "S1")).await.unwrap();
    service.claim_job(&job.id).await.unwrap().unwrap();
    let failed = service
        .update_job_state(&job.id, JobState::Failed, None, Some("boom".into()))
        .await
        .unwrap()
        .unwrap();

    let mut dispatched = bus
        .subscribe("job-events", AttributeFilter::event_type_in(&["JOB_DISPATCHED"]))
        .await
        .unwrap();
    let requeued = service
        .requeue_job(&job.id, failed.attempt, RequeueContext::BackoffRetry)
        .await
        .unwrap()
        .unwrap();
    check!(requeued.state == JobState::Created);
    let error = requeued.error.unwrap();
    check!(error.contains("boom"));
    check!(error.contains("BACKOFF_RETRY"));

    let delivery = dispatched.next().await.unwrap();
    check!(delivery.envelope.event_type() == Some("JOB_DISPATCHED"));

    // Stale recovery targets rows still stuck in RUNNING.
    let stuck = service.create_job(create_request(&project_id, "S2")).await.unwrap();
    service.claim_job(&stuck.id).await.unwrap().unwrap();
    let recovered = service
        .requeue_job(&stuck.id, stuck.attempt, RequeueContext::StaleRecovery)
        .await
        .unwrap()
        .unwrap();
    check!(recovered.state == JobState::Created);
    check!(recovered.error.unwrap().contains("STALE_RECOVERY"));
}

#[test]
async fn stale_requeue_is_a_noop() {
    let (service, _bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");
    let job = service.create_job(create_request(&project_id, "S1")).await.unwrap();
    service.claim_job(&job.id).await.unwrap().unwrap();
    let failed = service
        .update_job_state(&job.id, JobState::Failed, None, None)
        .await
        .unwrap()
        .unwrap();

    // The attempt moved on between the monitor's select and its update.
    let requeued = service
        .requeue_job(&job.id, failed.attempt - 1, RequeueContext::BackoffRetry)
        .await
        .unwrap();
    check!(requeued.is_none());
    let current = service.get_job(&job.id).await.unwrap().unwrap();
    check!(current.state == JobState::Failed);
    check!(current.attempt == failed.attempt);
}

#[test]
async fn terminal_rows_do_not_block_new_logical_records() {
    let (service, _bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");
    let job = service.create_job(create_request(&project_id, "S1")).await.unwrap();
    service.claim_job(&job.id).await.unwrap().unwrap();
    service
        .update_job_state(&job.id, JobState::Completed, Some(json!({"ok": true})), None)
        .await
        .unwrap()
        .unwrap();

    // The partial unique index only guards active states.
    let second = service.create_job(create_request(&project_id, "S1")).await;
    check!(second.is_ok());
}

#[test]
async fn cancel_is_terminal_and_published() {
    let (service, bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");
    let mut cancelled_events = bus
        .subscribe("job-events", AttributeFilter::event_type_in(&["JOB_CANCELLED"]))
        .await
        .unwrap();

    let job = service.create_job(create_request(&project_id, "S1")).await.unwrap();
    let cancelled = service.cancel_job(&job.id).await.unwrap().unwrap();
    check!(cancelled.state == JobState::Cancelled);

    let delivery = cancelled_events.next().await.unwrap();
    check!(delivery.envelope.event_type() == Some("JOB_CANCELLED"));

    // Cancelling a terminal row does nothing.
    let again = service.cancel_job(&job.id).await.unwrap();
    check!(again.is_none());
}

#[test]
async fn list_jobs_is_newest_first() {
    let (service, _bus) = job_service_with_bus();
    let project_id = ProjectId::from("P1");
    for index in 0..3 {
        service
            .create_job(create_request(&project_id, &format!("S{index}")))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    let jobs = service.list_jobs(&project_id).await.unwrap();
    check!(jobs.len() == 3);
    check!(jobs[0].created_at >= jobs[1].created_at);
    check!(jobs[1].created_at >= jobs[2].created_at);
}
