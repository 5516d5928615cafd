//! Configuration for the chanscan service.
//!
//! Configuration is layered: built-in defaults, then an optional file, then
//! environment variables prefixed with `CHANSCAN__` (double underscore
//! separates sections, e.g. `CHANSCAN__KAFKA__TOPIC`).

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Main configuration for the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    pub orchestrator: OrchestratorConfig,
    pub kafka: KafkaConfig,
    pub archive: ArchiveConfig,
    pub classifier: ClassifierConfig,
    pub reference: ReferenceConfig,
    pub checkpoint: CheckpointConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// When set, every shard also logs to a daily-rolled file in this directory
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Process layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Number of shard processes
    pub process_num: u32,
}

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// Stream source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    /// Topic carrying the image messages
    pub topic: String,
    /// First partition id (inclusive)
    #[serde(default)]
    pub partition_start: i32,
    /// Last partition id (inclusive)
    pub partition_end: i32,
    /// Group id handed to librdkafka; partitions are assigned manually
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub sasl_mechanism: SaslMechanism,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

/// Image archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Site directory name under the archive root
    pub site_id: String,
    pub archive_dir: PathBuf,
    /// Per-device metadata list filename
    #[serde(default = "default_dev_list")]
    pub dev_list: String,
    /// Hours subtracted from the device time before taking the date
    #[serde(default = "default_day_offset_hours")]
    pub day_offset_hours: i64,
    /// Message fields written to the metadata line, in order
    #[serde(default = "default_metadata_fields")]
    pub metadata_fields: Vec<String>,
}

/// Classification stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub url: String,
    /// Root of the per-day classification logs
    pub log_dir: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the handoff queue between ingestion and classification
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Capacity of the pool's internal work queue
    #[serde(default = "default_queue_capacity")]
    pub work_queue_capacity: usize,
    /// Unset means a request may wait indefinitely
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default = "default_flush_every_lines")]
    pub flush_every_lines: usize,
}

/// Reference table source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub url: String,
    pub cache_file: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    #[default]
    Redis,
    File,
}

/// How concurrent completions update the in-memory offset table
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OffsetPolicy {
    /// Keep the highest offset seen per partition
    #[default]
    Max,
    /// Keep whichever offset was recorded last
    LastWrite,
}

/// Checkpoint store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// Redis hash key holding all offsets
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    /// File backend location
    pub path: Option<PathBuf>,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_flush_every_ticks")]
    pub flush_every_ticks: u32,
    #[serde(default)]
    pub offset_policy: OffsetPolicy,
}

// Default value functions
fn default_service_name() -> String {
    "chanscan".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_group_id() -> String {
    "chanscan".to_string()
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_dev_list() -> String {
    "dev_list.csv".to_string()
}

/// Largest accepted shift between device time and archive day
pub const MAX_DAY_OFFSET_HOURS: i64 = 24;

fn default_day_offset_hours() -> i64 {
    2
}

pub fn default_metadata_fields() -> Vec<String> {
    ["img_name", "gzid", "device_id", "create_time", "province", "city", "isp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    5000
}

fn default_flush_every_lines() -> usize {
    10
}

fn default_prefix() -> String {
    "offset".to_string()
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_flush_every_ticks() -> u32 {
    600 // 50 minutes at the default heartbeat
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from an explicit file, or the default locations
    /// when none is given, with environment overrides on top
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?;

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder
                .add_source(config::File::with_name("config/chanscan").required(false))
                .add_source(config::File::with_name("/etc/chanscan/chanscan").required(false)),
        };

        let config: Config = builder
            // CHANSCAN__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("CHANSCAN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.process_num == 0 {
            return Err(invalid("orchestrator.process_num", "must be greater than 0"));
        }

        self.kafka.validate()?;

        if !(-MAX_DAY_OFFSET_HOURS..=MAX_DAY_OFFSET_HOURS).contains(&self.archive.day_offset_hours) {
            return Err(invalid(
                "archive.day_offset_hours",
                &format!("must be within ±{MAX_DAY_OFFSET_HOURS}"),
            ));
        }

        if self.archive.site_id.is_empty() {
            return Err(ConfigError::MissingRequired("archive.site_id".to_string()));
        }

        if self.classifier.url.is_empty() {
            return Err(ConfigError::MissingRequired("classifier.url".to_string()));
        }
        if self.classifier.workers == 0 {
            return Err(invalid("classifier.workers", "must be greater than 0"));
        }
        if self.classifier.queue_capacity == 0 || self.classifier.work_queue_capacity == 0 {
            return Err(invalid("classifier.queue_capacity", "must be greater than 0"));
        }
        if self.classifier.flush_every_lines == 0 {
            return Err(invalid("classifier.flush_every_lines", "must be greater than 0"));
        }

        if self.reference.url.is_empty() {
            return Err(ConfigError::MissingRequired("reference.url".to_string()));
        }

        if self.checkpoint.backend == CheckpointBackend::File && self.checkpoint.path.is_none() {
            return Err(ConfigError::MissingRequired(
                "checkpoint.path (required for the file backend)".to_string(),
            ));
        }
        if self.checkpoint.heartbeat_interval_secs == 0 || self.checkpoint.flush_every_ticks == 0 {
            return Err(invalid("checkpoint.heartbeat_interval_secs", "heartbeat must be non-zero"));
        }

        Ok(())
    }
}

impl KafkaConfig {
    /// Build the rdkafka consumer configuration
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", &self.group_id);
        config.set("security.protocol", self.security_protocol.as_str());
        config.set("session.timeout.ms", self.session_timeout_ms.to_string());
        // Offsets live in the checkpoint store, never in the broker
        config.set("enable.auto.commit", "false");
        config.set("enable.auto.offset.store", "false");
        config.set("auto.offset.reset", "earliest");

        if let Some(ref ca) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }

        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl_mechanism.as_str());
            if let Some(ref username) = self.sasl_username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl_password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired("kafka.bootstrap_servers".to_string()));
        }
        if self.topic.is_empty() {
            return Err(ConfigError::MissingRequired("kafka.topic".to_string()));
        }
        if self.partition_start < 0 || self.partition_end < self.partition_start {
            return Err(invalid(
                "kafka.partition_end",
                &format!(
                    "partition range [{}, {}] is empty or negative",
                    self.partition_start, self.partition_end
                ),
            ));
        }
        if self.security_protocol.uses_sasl() && self.sasl_username.is_none() {
            return Err(ConfigError::MissingRequired(
                "kafka.sasl_username (required for SASL)".to_string(),
            ));
        }
        Ok(())
    }
}

impl ClassifierConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl CheckpointConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Connection URL for the Redis backend
    pub fn redis_url(&self) -> String {
        match self.password {
            Some(ref password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
