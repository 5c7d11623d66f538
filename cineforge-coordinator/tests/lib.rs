test_r::enable!();

mod dispatcher_cases;
mod graph_routing;

use cineforge_common::config::PipelineConfig;
use cineforge_common::model::{JobState, ProjectId};
use cineforge_coordinator::checkpoint::Checkpointer;
use cineforge_coordinator::workflow::dispatcher::Dispatcher;
use cineforge_coordinator::workflow::graph::WorkflowGraph;
use cineforge_coordinator::workflow::stages::{StageContext, StageRunner};
use cineforge_service_base::events::InMemoryEventBus;
use cineforge_service_base::repo::checkpoint::InMemoryCheckpointRepo;
use cineforge_service_base::repo::job::InMemoryJobRepo;
use cineforge_service_base::repo::project::{InMemoryProjectRepo, ProjectRecord, ProjectRepo};
use cineforge_service_base::service::asset::AssetManagerDefault;
use cineforge_service_base::service::job::{JobService, JobServiceDefault};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct TestHarness {
    pub project_id: ProjectId,
    pub project_repo: Arc<InMemoryProjectRepo>,
    pub job_service: Arc<dyn JobService>,
    pub asset_manager: Arc<AssetManagerDefault>,
    pub dispatcher: Dispatcher,
    pub checkpointer: Arc<Checkpointer>,
}

impl TestHarness {
    pub async fn new(project_id: &str) -> Self {
        Self::with_pipeline(project_id, PipelineConfig::default()).await
    }

    pub async fn with_pipeline(project_id: &str, pipeline: PipelineConfig) -> Self {
        let project_id = ProjectId::from(project_id);
        let project_repo = Arc::new(InMemoryProjectRepo::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let job_service: Arc<dyn JobService> = Arc::new(JobServiceDefault::new(
            Arc::new(InMemoryJobRepo::new()),
            bus,
            pipeline.clone(),
        ));
        let asset_manager = Arc::new(AssetManagerDefault::new(project_repo.clone()));
        let dispatcher = Dispatcher::new(job_service.clone(), pipeline.max_parallel_jobs);
        let checkpointer = Checkpointer::new(Arc::new(InMemoryCheckpointRepo::new()));

        let now = Utc::now();
        project_repo
            .create(ProjectRecord {
                id: project_id.as_str().to_string(),
                status: "generating".to_string(),
                storyboard: None,
                metadata: json!({ "initialPrompt": "A red cube rotates" }),
                audio_analysis: None,
                metrics: json!({}),
                assets: json!({}),
                current_scene_index: 0,
                force_regenerate_scene_ids: vec![],
                generation_rules: vec![],
                generation_rules_history: json!([]),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        Self {
            project_id,
            project_repo,
            job_service,
            asset_manager,
            dispatcher,
            checkpointer,
        }
    }

    pub fn graph(&self, pipeline: PipelineConfig) -> WorkflowGraph {
        let runner = StageRunner::new(StageContext {
            project_repo: self.project_repo.clone(),
            asset_manager: self.asset_manager.clone(),
            dispatcher: Dispatcher::new(self.job_service.clone(), pipeline.max_parallel_jobs),
            pipeline,
        });
        WorkflowGraph::new(runner, self.checkpointer.clone())
    }

    /// Simulates a worker finishing the given job successfully.
    pub async fn complete_job(&self, job_id: &cineforge_common::model::JobId, result: Value) {
        self.job_service.claim_job(job_id).await.unwrap();
        self.job_service
            .update_job_state(job_id, JobState::Completed, Some(result), None)
            .await
            .unwrap()
            .unwrap();
    }

    /// Simulates a worker failing the given job.
    pub async fn fail_job(&self, job_id: &cineforge_common::model::JobId, error: &str) {
        self.job_service.claim_job(job_id).await.unwrap();
        self.job_service
            .update_job_state(job_id, JobState::Failed, None, Some(error.to_string()))
            .await
            .unwrap()
            .unwrap();
    }

    pub async fn latest_created_jobs(&self) -> Vec<cineforge_common::model::Job> {
        self.job_service
            .list_jobs(&self.project_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|job| job.state == JobState::Created)
            .collect()
    }
}
