use cineforge_common::tracing::init_tracing_with_default_env_filter;
use cineforge_service_base::events::InMemoryEventBus;
use cineforge_worker::config::make_config_loader;
use cineforge_worker::{metrics, WorkerServer};
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
                let event_bus = Arc::new(InMemoryEventBus::new());
                let server = WorkerServer::new(config, prometheus, event_bus).await?;

                let cancel = CancellationToken::new();
                let mut join_set = JoinSet::new();
                server.run(&mut join_set, cancel.clone()).await?;

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
