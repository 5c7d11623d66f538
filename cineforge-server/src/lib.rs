//! Runs the coordinator, a worker pool and the lifecycle monitor inside
//! one process over a shared in-process event bus. This is the single-node
//! deployment and the backbone of the end-to-end test suite.

pub mod config;

use crate::config::ServerConfig;
use cineforge_monitor::sweep::LifecycleMonitor;
use cineforge_monitor::MonitorService;
use cineforge_service_base::events::{EventBus, InMemoryEventBus};
use cineforge_service_base::repo::checkpoint::InMemoryCheckpointRepo;
use cineforge_service_base::repo::job::InMemoryJobRepo;
use cineforge_service_base::repo::lock::InMemoryLockRepo;
use cineforge_service_base::repo::project::InMemoryProjectRepo;
use cineforge_worker::clients::{
    GenerativeModelClient, MediaStore, StubGenerativeModelClient, StubMediaStore,
};
use cineforge_worker::WorkerServer;
use cineforge_coordinator::CoordinatorService;
use prometheus::Registry;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(test)]
test_r::enable!();

/// All three services wired over shared state. With `in_memory` the
/// cluster is fully hermetic; `new` runs against Postgres.
pub struct SingleNodeCluster {
    pub config: ServerConfig,
    pub event_bus: Arc<dyn EventBus>,
    pub coordinator: CoordinatorService,
    pub worker: WorkerServer,
    pub monitor: MonitorService,
    pub job_repo: Option<Arc<InMemoryJobRepo>>,
    pub project_repo: Option<Arc<InMemoryProjectRepo>>,
}

impl SingleNodeCluster {
    pub async fn new(config: ServerConfig, prometheus: Registry) -> anyhow::Result<Self> {
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let coordinator = CoordinatorService::new(
            config.coordinator(),
            prometheus.clone(),
            event_bus.clone(),
        )
        .await?;
        let worker =
            WorkerServer::new(config.worker(), prometheus.clone(), event_bus.clone()).await?;
        let monitor =
            MonitorService::new(config.monitor(), prometheus, event_bus.clone()).await?;
        Ok(Self {
            config,
            event_bus,
            coordinator,
            worker,
            monitor,
            job_repo: None,
            project_repo: None,
        })
    }

    /// Hermetic wiring over in-memory repositories and the deterministic
    /// collaborator stubs. Allows overriding the model client so failure
    /// paths can be exercised.
    pub fn in_memory(
        config: ServerConfig,
        model_client: Option<Arc<dyn GenerativeModelClient>>,
    ) -> Self {
        let prometheus = prometheus::default_registry().clone();
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let job_repo = Arc::new(InMemoryJobRepo::new());
        let project_repo = Arc::new(InMemoryProjectRepo::new());
        let lock_repo = Arc::new(InMemoryLockRepo::new());
        let checkpoint_repo = Arc::new(InMemoryCheckpointRepo::new());

        let coordinator_services = cineforge_coordinator::bootstrap::Services::make(
            &config.coordinator(),
            event_bus.clone(),
            job_repo.clone(),
            project_repo.clone(),
            lock_repo.clone(),
            checkpoint_repo,
        );
        let coordinator = CoordinatorService::from_services(
            config.coordinator(),
            prometheus.clone(),
            coordinator_services,
        );

        let model_client = model_client
            .unwrap_or_else(|| Arc::new(StubGenerativeModelClient::new()) as Arc<dyn GenerativeModelClient>);
        let media_store: Arc<dyn MediaStore> =
            Arc::new(StubMediaStore::new(&config.media.bucket));
        let worker_services = cineforge_worker::bootstrap::Services::make(
            &config.worker(),
            event_bus.clone(),
            job_repo.clone(),
            project_repo.clone(),
            lock_repo,
            model_client,
            media_store,
        );
        let worker =
            WorkerServer::from_services(config.worker(), prometheus.clone(), worker_services);

        let monitor_core = LifecycleMonitor::new(
            job_repo.clone(),
            worker.services().job_service.clone(),
            config.sweeps.clone(),
        );
        let monitor = MonitorService::from_monitor(config.monitor(), prometheus, monitor_core);

        Self {
            config,
            event_bus,
            coordinator,
            worker,
            monitor,
            job_repo: Some(job_repo),
            project_repo: Some(project_repo),
        }
    }

    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.coordinator.run(join_set, cancel.clone()).await?;
        self.worker.run(join_set, cancel.clone()).await?;
        self.monitor.run(join_set, cancel).await?;
        info!("single-node cluster started");
        Ok(())
    }
}
