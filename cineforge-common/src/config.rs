use crate::model::ExecutionMode;
use crate::SafeDisplay;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables recognized without the `CINEFORGE__` prefix,
/// mapped onto their nested config keys.
const PLAIN_ENV_KEYS: &[(&str, &str)] = &[
    ("MAX_CONCURRENT_JOBS_PER_PROJECT", "pipeline.max_concurrent_jobs_per_project"),
    ("MAX_PARALLEL_JOBS", "pipeline.max_parallel_jobs"),
    ("MAX_RETRIES", "pipeline.max_retries"),
    ("EXECUTION_MODE", "pipeline.execution_mode"),
    ("DATABASE_URL", "db.url"),
];

pub trait ConfigLoaderConfig: Default + Serialize + DeserializeOwned {}

impl<T: Default + Serialize + DeserializeOwned> ConfigLoaderConfig for T {}

/// Layered config loading: compiled defaults, then the TOML profile file,
/// then `CINEFORGE__`-prefixed environment overrides (with `__` as the
/// nesting separator), then the handful of plain env vars above.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    config_type: PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> Self {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            config_type: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed("CINEFORGE__").split("__"));
        for (env_key, config_key) in PLAIN_ENV_KEYS {
            if let Ok(raw) = std::env::var(env_key) {
                if let Ok(value) = raw.parse::<figment::value::Value>() {
                    figment = figment.merge(Serialized::global(*config_key, value));
                }
            }
        }
        figment
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the config, or dumps the effective defaults as TOML and
    /// returns `None` when `--dump-config` was passed. A load failure is a
    /// fatal initialization error.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            let default = T::default();
            match toml::to_string_pretty(&default) {
                Ok(dump) => println!("{dump}"),
                Err(error) => eprintln!("Failed to serialize default config: {error}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(error) => {
                    eprintln!(
                        "Failed to load config from {:?}: {error}",
                        self.config_file_name
                    );
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Postgres connection settings. The claim path relies on transactional
/// advisory locks, so there is no second database backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub max_connections: u32,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub statement_timeout: Duration,
    /// Full connection string override; takes precedence when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub breaker: CircuitBreakerConfig,
}

impl DbConfig {
    pub fn connection_string(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.username, self.password, self.host, self.port, self.database
            ),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "cineforge".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
            schema: None,
            max_connections: 20,
            acquire_timeout: Duration::from_secs(10),
            statement_timeout: Duration::from_secs(30),
            url: None,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl SafeDisplay for DbConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "host: {}", self.host);
        let _ = writeln!(&mut result, "port: {}", self.port);
        let _ = writeln!(&mut result, "database: {}", self.database);
        let _ = writeln!(&mut result, "username: {}", self.username);
        let _ = writeln!(&mut result, "password: ****");
        let _ = writeln!(&mut result, "max connections: {}", self.max_connections);
        let _ = writeln!(&mut result, "breaker:");
        let _ = writeln!(&mut result, "{}", self.breaker.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive connectivity/timeout failures before the breaker opens.
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

impl SafeDisplay for CircuitBreakerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "failure threshold: {}", self.failure_threshold);
        let _ = writeln!(&mut result, "cool down: {:?}", self.cool_down);
        result
    }
}

/// Project lease settings shared by every service that takes the lock.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

impl SafeDisplay for LockConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "lock TTL: {:?}", self.lock_ttl);
        let _ = writeln!(&mut result, "heartbeat interval: {:?}", self.heartbeat_interval);
        result
    }
}

/// Throttling and retry knobs of the job control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_concurrent_jobs_per_project: i64,
    pub max_parallel_jobs: usize,
    pub max_retries: i32,
    pub execution_mode: ExecutionMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs_per_project: 10,
            max_parallel_jobs: 2,
            max_retries: 2,
            execution_mode: ExecutionMode::Sequential,
        }
    }
}

impl SafeDisplay for PipelineConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "max concurrent jobs per project: {}",
            self.max_concurrent_jobs_per_project
        );
        let _ = writeln!(&mut result, "max parallel jobs: {}", self.max_parallel_jobs);
        let _ = writeln!(&mut result, "max retries: {}", self.max_retries);
        let _ = writeln!(&mut result, "execution mode: {}", self.execution_mode);
        result
    }
}

/// Subscriber-side delivery knobs shared by every bus consumer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Redeliveries before an event is dropped with an error log.
    pub max_delivery_attempts: u32,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 10,
        }
    }
}

impl SafeDisplay for EventsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "max delivery attempts: {}",
            self.max_delivery_attempts
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "max attempts: {}", self.max_attempts);
        let _ = writeln!(&mut result, "min delay: {:?}", self.min_delay);
        let _ = writeln!(&mut result, "max delay: {:?}", self.max_delay);
        let _ = writeln!(&mut result, "multiplier: {}", self.multiplier);
        result
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Default, Serialize, Deserialize)]
    struct TestConfig {
        pipeline: PipelineConfig,
        name: String,
    }

    #[test]
    fn defaults_load_without_a_config_file() {
        let loader: ConfigLoader<TestConfig> =
            ConfigLoader::new(&PathBuf::from("config/does-not-exist.toml"));
        let config = loader.load().expect("defaults must load");
        assert_eq!(config.pipeline.max_concurrent_jobs_per_project, 10);
        assert_eq!(config.pipeline.max_retries, 2);
    }
}
