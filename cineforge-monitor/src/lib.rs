pub mod config;
pub mod metrics;
pub mod sweep;

use crate::config::MonitorConfig;
use crate::sweep::LifecycleMonitor;
use anyhow::Context;
use cineforge_service_base::db::PostgresPool;
use cineforge_service_base::events::EventBus;
use cineforge_service_base::migration::{migrate, IncludedMigrationsDir};
use cineforge_service_base::repo::job::{DbJobRepo, JobRepo};
use cineforge_service_base::service::job::JobServiceDefault;
use include_dir::{include_dir, Dir};
use prometheus::Registry;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
test_r::enable!();

static DB_MIGRATIONS: Dir =
    include_dir!("$CARGO_MANIFEST_DIR/../cineforge-service-base/db/migration");

pub struct MonitorService {
    config: MonitorConfig,
    #[allow(dead_code)]
    prometheus_registry: Registry,
    monitor: Arc<LifecycleMonitor>,
}

impl MonitorService {
    pub async fn new(
        config: MonitorConfig,
        prometheus_registry: Registry,
        event_bus: Arc<dyn EventBus>,
    ) -> Result<Self, anyhow::Error> {
        debug!("Initializing lifecycle monitor");

        let migrations = IncludedMigrationsDir::new(&DB_MIGRATIONS);
        migrate(&config.db, migrations.postgres_migrations())
            .await
            .context("Postgres DB migration")?;

        let db_pool = PostgresPool::configured(&config.db)
            .await
            .context("DB pool initialization")?;
        let job_repo: Arc<dyn JobRepo> = Arc::new(DbJobRepo::new(db_pool));
        let job_service = Arc::new(JobServiceDefault::new(
            job_repo.clone(),
            event_bus,
            config.pipeline.clone(),
        ));
        let monitor = LifecycleMonitor::new(job_repo, job_service, config.sweeps.clone());

        Ok(Self {
            config,
            prometheus_registry,
            monitor,
        })
    }

    pub fn from_monitor(
        config: MonitorConfig,
        prometheus_registry: Registry,
        monitor: Arc<LifecycleMonitor>,
    ) -> Self {
        Self {
            config,
            prometheus_registry,
            monitor,
        }
    }

    pub fn monitor(&self) -> Arc<LifecycleMonitor> {
        self.monitor.clone()
    }

    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
        cancel: CancellationToken,
    ) -> Result<(), anyhow::Error> {
        let monitor = self.monitor.clone();
        let frequency = self.config.sweeps.frequency;
        join_set.spawn(async move {
            let mut ticker = tokio::time::interval(frequency);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.run_once().await;
                    }
                }
            }
            Ok(())
        });

        info!("Started lifecycle monitor");
        Ok(())
    }
}
