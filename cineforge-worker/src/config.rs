use cineforge_common::config::{
    ConfigLoader, DbConfig, EventsConfig, LockConfig, PipelineConfig,
};
use cineforge_common::tracing::TracingConfig;
use cineforge_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub db: DbConfig,
    pub locks: LockConfig,
    pub pipeline: PipelineConfig,
    pub events: EventsConfig,
    pub execution: ExecutionConfig,
    pub media: MediaConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("cineforge-worker"),
            environment: "dev".to_string(),
            db: DbConfig::default(),
            locks: LockConfig::default(),
            pipeline: PipelineConfig::default(),
            events: EventsConfig::default(),
            execution: ExecutionConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

impl SafeDisplay for WorkerConfig {
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
        let _ = writeln!(&mut result, "execution:");
        let _ = writeln!(&mut result, "{}", self.execution.to_safe_string_indented());
        let _ = writeln!(&mut result, "media:");
        let _ = writeln!(&mut result, "{}", self.media.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Concurrent jobs one worker process runs.
    pub concurrency: usize,
    /// Sanitize-and-retry budget for safety rejections.
    pub safety_retries: u32,
    /// Attempts to grab the project lock for the asset-write critical
    /// section before the job fails as transient.
    pub lock_acquire_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub lock_acquire_backoff: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            safety_retries: 2,
            lock_acquire_attempts: 10,
            lock_acquire_backoff: Duration::from_millis(250),
        }
    }
}

impl SafeDisplay for ExecutionConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "concurrency: {}", self.concurrency);
        let _ = writeln!(&mut result, "safety retries: {}", self.safety_retries);
        let _ = writeln!(
            &mut result,
            "lock acquire attempts: {}",
            self.lock_acquire_attempts
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaConfig {
    pub bucket: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            bucket: "cineforge-media".to_string(),
        }
    }
}

impl SafeDisplay for MediaConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "bucket: {}", self.bucket);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<WorkerConfig> {
    ConfigLoader::new(&PathBuf::from("config/worker.toml"))
}
