use cineforge_common::config::{ConfigLoader, DbConfig, PipelineConfig};
use cineforge_common::tracing::TracingConfig;
use cineforge_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub db: DbConfig,
    pub pipeline: PipelineConfig,
    pub sweeps: SweepConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("cineforge-monitor"),
            environment: "dev".to_string(),
            db: DbConfig::default(),
            pipeline: PipelineConfig::default(),
            sweeps: SweepConfig::default(),
        }
    }
}

impl SafeDisplay for MonitorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "sweeps:");
        let _ = writeln!(&mut result, "{}", self.sweeps.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Cadence of the maintenance pass.
    #[serde(with = "humantime_serde")]
    pub frequency: Duration,
    /// How long a RUNNING claim may go without a heartbeat-shaped
    /// `updated_at` touch before it is considered abandoned.
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            frequency: Duration::from_secs(60),
            stale_after: Duration::from_secs(600),
        }
    }
}

impl SafeDisplay for SweepConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "frequency: {:?}", self.frequency);
        let _ = writeln!(&mut result, "stale after: {:?}", self.stale_after);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<MonitorConfig> {
    ConfigLoader::new(&PathBuf::from("config/monitor.toml"))
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
