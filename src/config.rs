use crate::error::MessagingResult;
use crate::messaging::{NatsConfig, PublisherConfig, SubscriberConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use validator::Validate;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "EVENT_BUS_CONFIG";

/// Configuration file used when `EVENT_BUS_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/event-bus.toml";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    /// NATS connection
    #[serde(default)]
    #[validate(nested)]
    pub nats: NatsConfig,

    /// Publisher settings
    #[serde(default)]
    #[validate(nested)]
    pub publisher: PublisherConfig,

    /// Subscriber settings
    #[serde(default)]
    #[validate(nested)]
    pub subscriber: SubscriberConfig,

    /// Logging and metrics
    #[serde(default)]
    #[validate(nested)]
    pub observability: ObservabilityConfig,

    /// Host process settings
    #[serde(default)]
    pub host: HostConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> MessagingResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    /// Load configuration with `path` as the optional file layer
    pub fn load_from(path: impl AsRef<Path>) -> MessagingResult<Self> {
        let config: Self = config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::from(path.as_ref()).required(false))
            // Override with environment variables (prefix: EVENT_BUS_)
            .add_source(
                config::Environment::with_prefix("EVENT_BUS")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("nats.servers")
                    .with_list_parse_key("host.subjects")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// `tracing` filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Prefix for every exported metric name
    #[serde(default = "default_metrics_namespace")]
    #[validate(length(min = 1))]
    pub metrics_namespace: String,

    /// Constant labels attached to every metric
    #[serde(default)]
    pub default_tags: HashMap<String, String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            json_logs: false,
            metrics_namespace: default_metrics_namespace(),
            default_tags: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Subjects consumed by the host process
    #[serde(default)]
    pub subjects: Vec<String>,
}

fn default_log_filter() -> String {
    "llm_event_bus=info".to_string()
}

fn default_metrics_namespace() -> String {
    "event_bus".to_string()
}
