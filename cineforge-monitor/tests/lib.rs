test_r::enable!();

mod sweep_behavior;

use cineforge_common::config::PipelineConfig;
use cineforge_common::model::{AssetKind, JobType, ProjectId};
use cineforge_monitor::config::SweepConfig;
use cineforge_monitor::sweep::LifecycleMonitor;
use cineforge_service_base::events::InMemoryEventBus;
use cineforge_service_base::repo::job::InMemoryJobRepo;
use cineforge_service_base::service::job::{CreateJob, JobService, JobServiceDefault};
use serde_json::json;
use std::sync::Arc;

pub struct MonitorHarness {
    pub project_id: ProjectId,
    pub job_repo: Arc<InMemoryJobRepo>,
    pub job_service: Arc<dyn JobService>,
    pub monitor: Arc<LifecycleMonitor>,
    pub bus: Arc<InMemoryEventBus>,
}

impl MonitorHarness {
    pub fn new() -> Self {
        let job_repo = Arc::new(InMemoryJobRepo::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let job_service: Arc<dyn JobService> = Arc::new(JobServiceDefault::new(
            job_repo.clone(),
            bus.clone(),
            PipelineConfig::default(),
        ));
        let monitor = LifecycleMonitor::new(
            job_repo.clone(),
            job_service.clone(),
            SweepConfig::default(),
        );
        Self {
            project_id: ProjectId::from("P1"),
            job_repo,
            job_service,
            monitor,
            bus,
        }
    }

    pub async fn create_job(&self, unique_key: &str, max_retries: i32) -> cineforge_common::model::Job {
        self.job_service
            .create_job(CreateJob {
                job_type: JobType::GenerateSceneVideo,
                project_id: self.project_id.clone(),
                payload: json!({ "sceneId": unique_key }),
                unique_key: Some(unique_key.to_string()),
                asset_key: Some(AssetKind::SceneVideo),
                max_retries: Some(max_retries),
            })
            .await
            .unwrap()
    }
}
