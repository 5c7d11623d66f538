test_r::enable!();

mod worker_execution;

use cineforge_common::model::ProjectId;
use cineforge_service_base::events::InMemoryEventBus;
use cineforge_service_base::repo::job::InMemoryJobRepo;
use cineforge_service_base::repo::lock::InMemoryLockRepo;
use cineforge_service_base::repo::project::{
    InMemoryProjectRepo, ProjectRecord, ProjectRepo, SceneRecord,
};
use cineforge_service_base::service::asset::AssetManagerDefault;
use cineforge_service_base::service::job::JobService;
use cineforge_worker::bootstrap::Services;
use cineforge_worker::clients::{StubGenerativeModelClient, StubMediaStore};
use cineforge_worker::config::WorkerConfig;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

pub struct WorkerHarness {
    pub project_id: ProjectId,
    pub project_repo: Arc<InMemoryProjectRepo>,
    pub asset_manager: Arc<AssetManagerDefault>,
    pub job_service: Arc<dyn JobService>,
    pub services: Services,
}

impl WorkerHarness {
    pub async fn new(project_id: &str) -> Self {
        let config = WorkerConfig::default();
        let project_id = ProjectId::from(project_id);
        let project_repo = Arc::new(InMemoryProjectRepo::new());
        let bus = Arc::new(InMemoryEventBus::new());

        let services = Services::make(
            &config,
            bus,
            Arc::new(InMemoryJobRepo::new()),
            project_repo.clone(),
            Arc::new(InMemoryLockRepo::new()),
            Arc::new(StubGenerativeModelClient::new()),
            Arc::new(StubMediaStore::new("test-bucket")),
        );

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
            asset_manager: Arc::new(AssetManagerDefault::new(project_repo.clone())),
            project_repo,
            job_service: services.job_service.clone(),
            services,
        }
    }

    pub async fn add_scene(&self, scene_id: &str, index: i32) {
        let now = Utc::now();
        self.project_repo
            .upsert_scene(SceneRecord {
                id: scene_id.to_string(),
                project_id: self.project_id.as_str().to_string(),
                scene_index: index,
                title: format!("Scene {index}"),
                description: "a quiet interior".to_string(),
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
}
