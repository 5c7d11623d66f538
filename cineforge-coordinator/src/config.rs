use cineforge_common::config::{
    ConfigLoader, DbConfig, EventsConfig, LockConfig, PipelineConfig,
};
use cineforge_common::tracing::TracingConfig;
use cineforge_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub db: DbConfig,
    pub locks: LockConfig,
    pub pipeline: PipelineConfig,
    pub events: EventsConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("cineforge-coordinator"),
            environment: "dev".to_string(),
            db: DbConfig::default(),
            locks: LockConfig::default(),
            pipeline: PipelineConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl SafeDisplay for CoordinatorConfig {
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
        let _ = writeln!(&mut result, "events:");
        let _ = writeln!(&mut result, "{}", self.events.to_safe_string_indented());
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<CoordinatorConfig> {
    ConfigLoader::new(&PathBuf::from("config/coordinator.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::config::make_config_loader;

    #[test]
    pub fn config_is_loadable() {
        make_config_loader().load().expect("Failed to load config");
    }
}
