use crate::clients::{
    GenerativeModelClient, MediaStore, StubGenerativeModelClient, StubMediaStore,
};
use crate::config::WorkerConfig;
use crate::handlers::HandlerRegistry;
use crate::service::{HandlerContextTemplate, WorkerService};
use cineforge_common::model::WorkerId;
use cineforge_service_base::db::PostgresPool;
use cineforge_service_base::events::EventBus;
use cineforge_service_base::repo::job::{DbJobRepo, JobRepo};
use cineforge_service_base::repo::lock::{DbLockRepo, LockRepo};
use cineforge_service_base::repo::project::{DbProjectRepo, ProjectRepo};
use cineforge_service_base::service::asset::{AssetManager, AssetManagerDefault};
use cineforge_service_base::service::job::{JobService, JobServiceDefault};
use cineforge_service_base::service::lock::LockManager;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub worker: Arc<WorkerService>,
    pub job_service: Arc<dyn JobService>,
    pub lock_manager: Arc<LockManager>,
    pub event_bus: Arc<dyn EventBus>,
}

impl Services {
    pub async fn new(
        config: &WorkerConfig,
        event_bus: Arc<dyn EventBus>,
    ) -> Result<Self, String> {
        let db_pool = PostgresPool::configured(&config.db)
            .await
            .map_err(|e| e.to_string())?;
        let circuit_events = db_pool.subscribe_circuit_events();

        let job_repo: Arc<dyn JobRepo> = Arc::new(DbJobRepo::new(db_pool.clone()));
        let project_repo: Arc<dyn ProjectRepo> = Arc::new(DbProjectRepo::new(db_pool.clone()));
        let lock_repo: Arc<dyn LockRepo> = Arc::new(DbLockRepo::new(db_pool.clone()));

        let model_client: Arc<dyn GenerativeModelClient> =
            Arc::new(StubGenerativeModelClient::new());
        let media_store: Arc<dyn MediaStore> = Arc::new(StubMediaStore::new(&config.media.bucket));

        let services = Self::make(
            config,
            event_bus,
            job_repo,
            project_repo,
            lock_repo,
            model_client,
            media_store,
        );
        services.lock_manager.spawn_circuit_watch(circuit_events);
        Ok(services)
    }

    /// Repo- and client-injected wiring, shared by the Postgres path and
    /// the single-process server.
    pub fn make(
        config: &WorkerConfig,
        event_bus: Arc<dyn EventBus>,
        job_repo: Arc<dyn JobRepo>,
        project_repo: Arc<dyn ProjectRepo>,
        lock_repo: Arc<dyn LockRepo>,
        model_client: Arc<dyn GenerativeModelClient>,
        media_store: Arc<dyn MediaStore>,
    ) -> Self {
        let job_service: Arc<dyn JobService> = Arc::new(JobServiceDefault::new(
            job_repo,
            event_bus.clone(),
            config.pipeline.clone(),
        ));
        let asset_manager: Arc<dyn AssetManager> =
            Arc::new(AssetManagerDefault::new(project_repo.clone()));
        let lock_manager = LockManager::new(lock_repo, WorkerId::generated());

        let worker = WorkerService::new(
            job_service.clone(),
            asset_manager,
            lock_manager.clone(),
            Arc::new(HandlerRegistry::standard()),
            Arc::new(HandlerContextTemplate {
                model_client,
                media_store,
                project_repo,
            }),
            config.execution.clone(),
            config.locks.clone(),
        );

        Self {
            worker,
            job_service,
            lock_manager,
            event_bus,
        }
    }
}
