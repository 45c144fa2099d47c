//! Configuration module for eventline.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [app]
//! name = "shop"
//!
//! [kafka]
//! brokers = ["${KAFKA_HOST}:9092"]
//!
//! [worker]
//! poll_timeout_secs = 5
//! max_backoff_secs = 10
//!
//! [[listeners]]
//! group = "audit"
//! topics = ["orders", "refunds"]
//! handler = "log:audit"
//! ```

use crate::escalation::FailureTopics;
use crate::handlers::LogHandler;
use crate::registry::{ListenerRegistry, RegistryError};
use crate::worker::WorkerSettings;
use crate::{MAX_BACKOFF, POLL_TIMEOUT};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid listener: {0}")]
    ListenerError(#[from] RegistryError),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EventlineConfig {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub worker: PollingConfig,

    #[serde(default)]
    pub producer: ProducerConfig,

    /// Listeners wired from configuration rather than code
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

/// Application identity
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Stamped into every envelope and used to derive the retry and
    /// dead-letter topic names
    #[serde(default = "default_app_name")]
    pub name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
        }
    }
}

fn default_app_name() -> String {
    env::var("APP_NAME").unwrap_or_else(|_| "Kafka".to_string())
}

/// Kafka connection settings
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    #[serde(default)]
    pub ssl_enabled: bool,

    #[serde(default)]
    pub sasl_mechanism: Option<String>,

    #[serde(default)]
    pub sasl_username: Option<String>,

    #[serde(default)]
    pub sasl_password: Option<String>,

    #[serde(default)]
    pub client_id: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            ssl_enabled: false,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            client_id: None,
        }
    }
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

/// Worker poll and backoff timings
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Pause added per consecutive failure
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: default_poll_timeout_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            backoff_unit_ms: default_backoff_unit_ms(),
        }
    }
}

fn default_poll_timeout_secs() -> u64 {
    POLL_TIMEOUT.as_secs()
}

fn default_max_backoff_secs() -> u64 {
    MAX_BACKOFF.as_secs()
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

impl PollingConfig {
    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            backoff_unit: Duration::from_millis(self.backoff_unit_ms),
        }
    }
}

/// Producer settings
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    /// How long shutdown waits for outstanding deliveries
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,

    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            flush_timeout_secs: default_flush_timeout_secs(),
            message_timeout_ms: default_message_timeout_ms(),
        }
    }
}

fn default_flush_timeout_secs() -> u64 {
    5
}

fn default_message_timeout_ms() -> u64 {
    30000
}

impl ProducerConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }
}

/// A listener declared in configuration.
///
/// `handler` is `"log"` or `"log:<prefix>"`.
#[derive(Debug, Deserialize, Clone)]
pub struct ListenerConfig {
    pub group: String,

    pub topics: Vec<String>,

    #[serde(default)]
    pub namespaces: Option<Vec<String>>,

    #[serde(default = "default_handler")]
    pub handler: String,
}

fn default_handler() -> String {
    "log".to_string()
}

impl EventlineConfig {
    /// Load configuration from the default path or EVENTLINE_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("EVENTLINE_CONFIG").unwrap_or_else(|_| "config/eventline.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            info!(path = %path.display(), "Loading configuration");

            let content = fs::read_to_string(path)?;
            let content = substitute_env_vars(&content);

            debug!("Parsing TOML configuration");
            toml::from_str::<EventlineConfig>(&content)?
        } else {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        info!(
            app = %config.app.name,
            brokers = ?config.kafka.brokers,
            listeners = config.listeners.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// `KAFKA_BOOTSTRAP_SERVERS` (comma separated) replaces the broker list.
    fn apply_env_overrides(&mut self) {
        if let Ok(servers) = env::var("KAFKA_BOOTSTRAP_SERVERS") {
            let brokers: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();

            if !brokers.is_empty() {
                debug!(brokers = ?brokers, "Brokers overridden from environment");
                self.kafka.brokers = brokers;
            }
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.app.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "app.name must not be empty".to_string(),
            ));
        }

        if self.kafka.brokers.is_empty() || self.kafka.brokers.iter().any(|b| b.is_empty()) {
            return Err(ConfigError::ValidationError(
                "kafka.brokers must list at least one address".to_string(),
            ));
        }

        for broker in &self.kafka.brokers {
            if broker.contains("${") {
                warn!(
                    broker = %broker,
                    "Broker address contains unsubstituted environment variable"
                );
            }
        }

        if self.worker.poll_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "worker.poll_timeout_secs must be positive".to_string(),
            ));
        }

        for listener in &self.listeners {
            if listener.group.is_empty() || listener.topics.is_empty() {
                return Err(ConfigError::ValidationError(
                    "listeners need a group and at least one topic".to_string(),
                ));
            }

            if handler_prefix(&listener.handler).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "listener for group '{}' has unknown handler '{}'",
                    listener.group, listener.handler
                )));
            }
        }

        Ok(())
    }

    /// Retry and dead-letter names for this application.
    pub fn failure_topics(&self) -> FailureTopics {
        FailureTopics::for_app(&self.app.name)
    }

    /// Build a registry holding the configured listeners.
    ///
    /// Applications usually register their own handlers on the returned
    /// registry before handing it to the orchestrator.
    pub fn build_registry(&self) -> Result<ListenerRegistry, ConfigError> {
        let mut registry = ListenerRegistry::with_reserved(self.failure_topics());

        for listener in &self.listeners {
            let prefix = handler_prefix(&listener.handler).ok_or_else(|| {
                ConfigError::ValidationError(format!("unknown handler '{}'", listener.handler))
            })?;

            registry.register(
                &listener.group,
                &listener.topics,
                listener.namespaces.as_deref(),
                Arc::new(LogHandler::with_prefix(prefix)),
            )?;
        }

        Ok(registry)
    }
}

/// Log prefix for a `"log"` / `"log:<prefix>"` handler reference.
fn handler_prefix(handler: &str) -> Option<&str> {
    match handler.split_once(':') {
        Some(("log", prefix)) if !prefix.is_empty() => Some(prefix),
        None if handler == "log" => Some("event"),
        _ => None,
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
