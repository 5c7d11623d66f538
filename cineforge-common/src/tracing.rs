use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    /// Emit one JSON object per line instead of the human-readable format.
    pub json_output: bool,
    pub ansi: bool,
    /// Used when `RUST_LOG` is not set.
    pub default_directive: String,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json_output: false,
            ansi: true,
            default_directive: "info".to_string(),
        }
    }

    pub fn production(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json_output: true,
            ansi: false,
            default_directive: "info".to_string(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("cineforge")
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "service name: {}", self.service_name);
        let _ = writeln!(&mut result, "json output: {}", self.json_output);
        let _ = writeln!(&mut result, "default directive: {}", self.default_directive);
        result
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// default directive.
pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive.clone()));

    if config.json_output {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_ansi(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(config.ansi))
            .init();
    }
}
