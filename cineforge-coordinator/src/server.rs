use cineforge_common::tracing::init_tracing_with_default_env_filter;
use cineforge_coordinator::config::make_config_loader;
use cineforge_coordinator::{metrics, CoordinatorService};
use cineforge_service_base::events::InMemoryEventBus;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match make_config_loader().load_or_dump_config() {
        Some(config) => {
            init_tracing_with_default_env_filter(&config.tracing);
            let prometheus = metrics::register_all();

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;

            runtime.block_on(async {
                // A brokered bus adapter can be plugged in here; the
                // in-process broker serves single-node deployments.
                let event_bus = Arc::new(InMemoryEventBus::new());
                let service =
                    CoordinatorService::new(config, prometheus, event_bus).await?;

                let cancel = CancellationToken::new();
                let mut join_set = JoinSet::new();
                service.run(&mut join_set, cancel.clone()).await?;

                tokio::signal::ctrl_c().await?;
                tracing::info!("shutting down");
                cancel.cancel();
                while let Some(result) = join_set.join_next().await {
                    result??;
                }
                Ok::<(), anyhow::Error>(())
            })?;
            Ok(())
        }
        None => Ok(()),
    }
}
