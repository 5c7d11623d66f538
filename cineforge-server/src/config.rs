use cineforge_common::config::{
    ConfigLoader, DbConfig, EventsConfig, LockConfig, PipelineConfig,
};
use cineforge_common::tracing::TracingConfig;
use cineforge_common::SafeDisplay;
use cineforge_coordinator::config::CoordinatorConfig;
use cineforge_monitor::config::{MonitorConfig, SweepConfig};
use cineforge_worker::config::{ExecutionConfig, MediaConfig, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;

/// One config for all three services when they run inside a single
/// process sharing one in-process event bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub db: DbConfig,
    pub locks: LockConfig,
    pub pipeline: PipelineConfig,
    pub events: EventsConfig,
    pub execution: ExecutionConfig,
    pub media: MediaConfig,
    pub sweeps: SweepConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("cineforge-server"),
            environment: "dev".to_string(),
            db: DbConfig::default(),
            locks: LockConfig::default(),
            pipeline: PipelineConfig::default(),
            events: EventsConfig::default(),
            execution: ExecutionConfig::default(),
            media: MediaConfig::default(),
            sweeps: SweepConfig::default(),
        }
    }
}

impl SafeDisplay for ServerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "locks:");
        let _ = writeln!(&mut result, "{}", self.locks.to_safe_string_indented());
        let _ = writeln!(&mut result, "pipeline:");
        let _ = writeln!(&mut result, "{}", self.pipeline.to_safe_string_indented());
        result
    }
}

impl ServerConfig {
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            tracing: self.tracing.clone(),
            environment: self.environment.clone(),
            db: self.db.clone(),
            locks: self.locks.clone(),
            pipeline: self.pipeline.clone(),
            events: self.events.clone(),
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            tracing: self.tracing.clone(),
            environment: self.environment.clone(),
            db: self.db.clone(),
            locks: self.locks.clone(),
            pipeline: self.pipeline.clone(),
            events: self.events.clone(),
            execution: self.execution.clone(),
            media: self.media.clone(),
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            tracing: self.tracing.clone(),
            environment: self.environment.clone(),
            db: self.db.clone(),
            pipeline: self.pipeline.clone(),
            sweeps: self.sweeps.clone(),
        }
    }
}

pub fn make_config_loader() -> ConfigLoader<ServerConfig> {
    ConfigLoader::new(&PathBuf::from("config/server.toml"))
}
