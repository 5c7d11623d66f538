use crate::checkpoint::Checkpointer;
use crate::config::CoordinatorConfig;
use crate::operator::Operator;
use crate::workflow::dispatcher::Dispatcher;
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::stages::{StageContext, StageRunner};
use cineforge_common::model::WorkerId;
use cineforge_service_base::db::PostgresPool;
use cineforge_service_base::events::EventBus;
use cineforge_service_base::repo::checkpoint::{CheckpointRepo, DbCheckpointRepo};
use cineforge_service_base::repo::job::{DbJobRepo, JobRepo};
use cineforge_service_base::repo::lock::{DbLockRepo, LockRepo};
use cineforge_service_base::repo::project::{DbProjectRepo, ProjectRepo};
use cineforge_service_base::service::asset::{AssetManager, AssetManagerDefault};
use cineforge_service_base::service::job::{JobService, JobServiceDefault};
use cineforge_service_base::service::lock::LockManager;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub operator: Arc<Operator>,
    pub job_service: Arc<dyn JobService>,
    pub asset_manager: Arc<dyn AssetManager>,
    pub lock_manager: Arc<LockManager>,
    pub checkpointer: Arc<Checkpointer>,
    pub event_bus: Arc<dyn EventBus>,
}

impl Services {
    pub async fn new(
        config: &CoordinatorConfig,
        event_bus: Arc<dyn EventBus>,
    ) -> Result<Self, String> {
        let db_pool = PostgresPool::configured(&config.db)
            .await
            .map_err(|e| e.to_string())?;
        let circuit_events = db_pool.subscribe_circuit_events();

        let job_repo: Arc<dyn JobRepo> = Arc::new(DbJobRepo::new(db_pool.clone()));
        let project_repo: Arc<dyn ProjectRepo> = Arc::new(DbProjectRepo::new(db_pool.clone()));
        let lock_repo: Arc<dyn LockRepo> = Arc::new(DbLockRepo::new(db_pool.clone()));
        let checkpoint_repo: Arc<dyn CheckpointRepo> =
            Arc::new(DbCheckpointRepo::new(db_pool.clone()));

        let services = Self::make(
            config,
            event_bus,
            job_repo,
            project_repo,
            lock_repo,
            checkpoint_repo,
        );
        services.lock_manager.spawn_circuit_watch(circuit_events);
        Ok(services)
    }

    /// Repo-injected wiring, shared by the Postgres path, the
    /// single-process server and the scenario tests.
    pub fn make(
        config: &CoordinatorConfig,
        event_bus: Arc<dyn EventBus>,
        job_repo: Arc<dyn JobRepo>,
        project_repo: Arc<dyn ProjectRepo>,
        lock_repo: Arc<dyn LockRepo>,
        checkpoint_repo: Arc<dyn CheckpointRepo>,
    ) -> Self {
        let job_service: Arc<dyn JobService> = Arc::new(JobServiceDefault::new(
            job_repo,
            event_bus.clone(),
            config.pipeline.clone(),
        ));

        let asset_manager: Arc<dyn AssetManager> =
            Arc::new(AssetManagerDefault::new(project_repo.clone()));

        let lock_manager = LockManager::new(lock_repo, WorkerId::generated());

        let checkpointer = Checkpointer::new(checkpoint_repo);

        let dispatcher = Dispatcher::new(job_service.clone(), config.pipeline.max_parallel_jobs);
        let runner = StageRunner::new(StageContext {
            project_repo: project_repo.clone(),
            asset_manager: asset_manager.clone(),
            dispatcher,
            pipeline: config.pipeline.clone(),
        });
        let graph = WorkflowGraph::new(runner, checkpointer.clone());

        let operator = Operator::new(
            project_repo,
            job_service.clone(),
            asset_manager.clone(),
            lock_manager.clone(),
            checkpointer.clone(),
            graph,
            event_bus.clone(),
            config.locks.clone(),
        );

        Self {
            operator,
            job_service,
            asset_manager,
            lock_manager,
            checkpointer,
            event_bus,
        }
    }
}
