pub mod bootstrap;
pub mod checkpoint;
pub mod config;
pub mod metrics;
pub mod model;
pub mod operator;
pub mod subscriptions;
pub mod workflow;

use crate::bootstrap::Services;
use crate::config::CoordinatorConfig;
use crate::subscriptions::{CommandHandler, JobEventHandler};
use anyhow::Context;
use cineforge_common::model::{COMMANDS_TOPIC, JOB_EVENTS_TOPIC};
use cineforge_service_base::events::subscriber::run_subscriber_loop;
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

pub struct CoordinatorService {
    config: CoordinatorConfig,
    #[allow(dead_code)]
    prometheus_registry: Registry,
    services: Services,
}

impl CoordinatorService {
    pub async fn new(
        config: CoordinatorConfig,
        prometheus_registry: Registry,
        event_bus: Arc<dyn EventBus>,
    ) -> Result<Self, anyhow::Error> {
        debug!("Initializing coordinator service");

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

    /// Test/embedded construction with pre-wired services; skips
    /// migrations.
    pub fn from_services(
        config: CoordinatorConfig,
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

    /// Spawns the two subscriber loops. The returned tasks run until the
    /// cancellation token fires or the bus hangs up.
    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
        cancel: CancellationToken,
    ) -> Result<(), anyhow::Error> {
        let job_events = self
            .services
            .event_bus
            .subscribe(
                JOB_EVENTS_TOPIC,
                AttributeFilter::event_type_in(&["JOB_COMPLETED", "JOB_FAILED"]),
            )
            .await?;
        let commands = self
            .services
            .event_bus
            .subscribe(COMMANDS_TOPIC, AttributeFilter::all())
            .await?;

        let job_handler = JobEventHandler::new(self.services.operator.clone());
        let command_handler = CommandHandler::new(self.services.operator.clone());
        let max_attempts = self.config.events.max_delivery_attempts;

        {
            let cancel = cancel.clone();
            join_set.spawn(async move {
                run_subscriber_loop("job-events", job_events, cancel, max_attempts, job_handler)
                    .await;
                Ok(())
            });
        }
        {
            let cancel = cancel.clone();
            join_set.spawn(async move {
                run_subscriber_loop("commands", commands, cancel, max_attempts, command_handler)
                    .await;
                Ok(())
            });
        }

        // Release whatever we still hold when shutting down.
        {
            let lock_manager = self.services.lock_manager.clone();
            join_set.spawn(async move {
                cancel.cancelled().await;
                let _ = lock_manager.release_all_locks().await;
                Ok(())
            });
        }

        info!("Started coordinator service");
        Ok(())
    }
}
