pub mod bootstrap;
pub mod clients;
pub mod config;
pub mod handler;
pub mod handlers;
pub mod metrics;
pub mod service;

use crate::bootstrap::Services;
use crate::config::WorkerConfig;
use anyhow::Context;
use cineforge_common::model::JOB_EVENTS_TOPIC;
use cineforge_service_base::events::{AttributeFilter, EventBus};
use cineforge_service_base::migration::{migrate, IncludedMigrationsDir};
use include_dir::{include_dir, Dir};
use prometheus::Registry;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
test_r::enable!();

static DB_MIGRATIONS: Dir =
    include_dir!("$CARGO_MANIFEST_DIR/../cineforge-service-base/db/migration");

pub struct WorkerServer {
    #[allow(dead_code)]
    config: WorkerConfig,
    #[allow(dead_code)]
    prometheus_registry: Registry,
    services: Services,
}

impl WorkerServer {
    pub async fn new(
        config: WorkerConfig,
        prometheus_registry: Registry,
        event_bus: Arc<dyn EventBus>,
    ) -> Result<Self, anyhow::Error> {
        debug!("Initializing worker service");

        let migrations = IncludedMigrationsDir::new(&DB_MIGRATIONS);
        migrate(&config.db, migrations.postgres_migrations())
            .await
            .context("Postgres DB migration")?;

        let services = Services::new(&config, event_bus)
            .await
            .map_err(|err| anyhow::anyhow!(err).context("Service initialization"))?;

        Ok(Self {
            config,
            prometheus_registry,
            services,
        })
    }

    pub fn from_services(
        config: WorkerConfig,
        prometheus_registry: Registry,
        services: Services,
    ) -> Self {
        Self {
            config,
            prometheus_registry,
            services,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
        cancel: CancellationToken,
    ) -> Result<(), anyhow::Error> {
        let dispatches = self
            .services
            .event_bus
            .subscribe(
                JOB_EVENTS_TOPIC,
                AttributeFilter::event_type_in(&["JOB_DISPATCHED"]),
            )
            .await?;

        let worker = self.services.worker.clone();
        {
            let cancel = cancel.clone();
            join_set.spawn(async move {
                worker.run_dispatch_loop(dispatches, cancel).await;
                Ok(())
            });
        }

        {
            let lock_manager = self.services.lock_manager.clone();
            join_set.spawn(async move {
                cancel.cancelled().await;
                let _ = lock_manager.release_all_locks().await;
                Ok(())
            });
        }

        info!("Started worker service");
        Ok(())
    }
}
