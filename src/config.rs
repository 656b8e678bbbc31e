//! Configuration management for Streamhook
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{Result, StreamhookError};
use crate::event::OperationType;
use crate::filter::{EventFilter, FilterStage};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration structure for Streamhook
///
/// One configuration describes one subscription: a change source, the
/// filter applied to it, the notification target, and where the resume
/// position and dead letters are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Subscription name; keys the checkpoint and seeds dedup identifiers
    #[serde(default = "default_subscription")]
    pub subscription: String,

    /// Change source settings
    #[serde(default)]
    pub source: SourceConfig,

    /// Event filter stages
    #[serde(default)]
    pub filter: FilterConfig,

    /// Notification target settings
    #[serde(default)]
    pub target: TargetConfig,

    /// Payload shaping applied before delivery
    #[serde(default)]
    pub payload: PayloadConfig,

    /// Retry and backoff policy
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Queueing, worker and shutdown settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Checkpoint persistence
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Dead-letter persistence
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_subscription() -> String {
    "default".to_string()
}

/// Where to begin when no resume position has been stored yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartFrom {
    /// Only changes made after subscribing ("start from now")
    #[default]
    Latest,
    /// Everything the source still retains
    Earliest,
}

impl FromStr for StartFrom {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "latest" | "now" => Ok(Self::Latest),
            "earliest" | "beginning" => Ok(Self::Earliest),
            other => Err(format!("invalid start position: {}", other)),
        }
    }
}

/// Change source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source endpoint (`file://<path>` change log or `http(s)://` feed)
    #[serde(default = "default_source_endpoint")]
    pub endpoint: String,

    /// Start policy used when no checkpoint exists
    #[serde(default)]
    pub start_from: StartFrom,

    /// Interval between polls when the source has no new events
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Reconnect attempts before the loop reports itself degraded
    ///
    /// The loop keeps retrying after the budget is spent; `None` never
    /// escalates.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
}

fn default_source_endpoint() -> String {
    "file://changes.jsonl".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_source_endpoint(),
            start_from: StartFrom::default(),
            poll_interval_ms: default_poll_interval_ms(),
            max_reconnect_attempts: None,
        }
    }
}

/// Event filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Ordered stages; an event must pass every stage
    #[serde(default = "default_filter_stages")]
    pub stages: Vec<FilterStage>,
}

fn default_filter_stages() -> Vec<FilterStage> {
    vec![FilterStage::OperationType {
        types: vec![OperationType::Insert],
    }]
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            stages: default_filter_stages(),
        }
    }
}

/// Notification target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target endpoint (`http(s)://` webhook, or `log` for the console target)
    #[serde(default = "default_target_endpoint")]
    pub endpoint: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_target_timeout")]
    pub timeout_secs: u64,

    /// Extra headers sent with every webhook request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_target_endpoint() -> String {
    "log".to_string()
}

fn default_target_timeout() -> u64 {
    30
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            endpoint: default_target_endpoint(),
            timeout_secs: default_target_timeout(),
            headers: BTreeMap::new(),
        }
    }
}

/// Payload shaping configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayloadConfig {
    /// Dotted document paths removed before the payload leaves the process
    #[serde(default)]
    pub redact_fields: Vec<String>,
}

/// Delivery retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Attempts per task before it is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum retry delay in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Relative jitter applied to each delay (0.2 = ±20%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bounded queue between the consumer loop and the delivery workers
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of delivery workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Time allowed for in-flight tasks to finish on shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_workers() -> usize {
    1
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Checkpoint storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// Single JSON file replaced atomically on every save
    #[default]
    File,
    /// Embedded sled database, one key per subscription
    Sled,
}

/// Checkpoint configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Storage backend
    #[serde(default)]
    pub backend: CheckpointBackend,

    /// Storage location (file for `file`, directory for `sled`)
    ///
    /// Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Dead-letter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// SQLite database path; defaults to the platform data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON-formatted logs
    #[serde(default = "default_json_logs")]
    pub json_format: bool,

    /// Log file path (if None, STDOUT only)
    pub file_path: Option<PathBuf>,

    /// Include full event documents in logs
    #[serde(default)]
    pub include_payload: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json_logs() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: default_json_logs(),
            file_path: None,
            include_payload: false,
        }
    }
}

/// Reads and parses an environment variable, warning on invalid values
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => {
            tracing::debug!(var = name, value = %raw, "Env override");
            Some(value)
        }
        Err(_) => {
            tracing::warn!("Invalid value for {}: {}", name, raw);
            None
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file is not an error; defaults are used instead so that a
    /// deployment can be configured purely through `STREAMHOOK_*` variables.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| StreamhookError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| StreamhookError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(subscription) = std::env::var("STREAMHOOK_SUBSCRIPTION") {
            self.subscription = subscription;
        }

        if let Ok(endpoint) = std::env::var("STREAMHOOK_SOURCE_ENDPOINT") {
            self.source.endpoint = endpoint;
        }

        if let Some(start_from) = env_parse::<StartFrom>("STREAMHOOK_START_FROM") {
            self.source.start_from = start_from;
        }

        if let Ok(endpoint) = std::env::var("STREAMHOOK_TARGET_ENDPOINT") {
            self.target.endpoint = endpoint;
        }

        // Replaces the whole stage list with a single operation-type stage
        if let Ok(raw) = std::env::var("STREAMHOOK_OPERATION_TYPES") {
            let parsed: std::result::Result<Vec<OperationType>, _> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            match parsed {
                Ok(types) if !types.is_empty() => {
                    self.filter.stages = vec![FilterStage::OperationType { types }];
                }
                _ => tracing::warn!("Invalid value for STREAMHOOK_OPERATION_TYPES: {}", raw),
            }
        }

        if let Some(v) = env_parse("STREAMHOOK_MAX_ATTEMPTS") {
            self.delivery.max_attempts = v;
        }
        if let Some(v) = env_parse("STREAMHOOK_BACKOFF_BASE_MS") {
            self.delivery.backoff_base_ms = v;
        }
        if let Some(v) = env_parse("STREAMHOOK_BACKOFF_CAP_MS") {
            self.delivery.backoff_cap_ms = v;
        }
        if let Some(v) = env_parse("STREAMHOOK_QUEUE_CAPACITY") {
            self.pipeline.queue_capacity = v;
        }
        if let Some(v) = env_parse("STREAMHOOK_WORKERS") {
            self.pipeline.workers = v;
        }
        if let Some(v) = env_parse("STREAMHOOK_SHUTDOWN_TIMEOUT_MS") {
            self.pipeline.shutdown_timeout_ms = v;
        }

        if let Ok(path) = std::env::var("STREAMHOOK_CHECKPOINT_PATH") {
            self.checkpoint.path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("STREAMHOOK_DEAD_LETTER_PATH") {
            self.dead_letter.path = Some(PathBuf::from(path));
        }

        if let Ok(level) = std::env::var("STREAMHOOK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = env_parse("STREAMHOOK_JSON_LOGS") {
            self.logging.json_format = v;
        }
        if let Ok(log_file) = std::env::var("STREAMHOOK_LOG_FILE") {
            self.logging.file_path = Some(PathBuf::from(log_file));
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }

        if let crate::cli::Commands::Run {
            start_from,
            json_logs,
            log_file,
            ..
        } = &cli.command
        {
            if let Some(start_from) = start_from {
                self.source.start_from = *start_from;
            }
            if *json_logs {
                self.logging.json_format = true;
            }
            if let Some(log_file) = log_file {
                self.logging.file_path = Some(log_file.clone());
            }
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `StreamhookError::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.subscription.trim().is_empty() {
            return Err(StreamhookError::Config("subscription cannot be empty".to_string()).into());
        }

        if self.source.endpoint.trim().is_empty() {
            return Err(
                StreamhookError::Config("source.endpoint cannot be empty".to_string()).into(),
            );
        }

        if self.source.poll_interval_ms == 0 {
            return Err(StreamhookError::Config(
                "source.poll_interval_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if self.target.endpoint.trim().is_empty() {
            return Err(
                StreamhookError::Config("target.endpoint cannot be empty".to_string()).into(),
            );
        }

        if self.delivery.max_attempts == 0 {
            return Err(StreamhookError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            )
            .into());
        }

        if self.delivery.backoff_base_ms == 0 {
            return Err(StreamhookError::Config(
                "delivery.backoff_base_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if self.delivery.backoff_cap_ms < self.delivery.backoff_base_ms {
            return Err(StreamhookError::Config(
                "delivery.backoff_cap_ms must be at least delivery.backoff_base_ms".to_string(),
            )
            .into());
        }

        if !(0.0..1.0).contains(&self.delivery.jitter) {
            return Err(StreamhookError::Config(
                "delivery.jitter must be between 0.0 (inclusive) and 1.0 (exclusive)".to_string(),
            )
            .into());
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(StreamhookError::Config(
                "pipeline.queue_capacity must be greater than 0".to_string(),
            )
            .into());
        }

        if self.pipeline.workers == 0 || self.pipeline.workers > 64 {
            return Err(StreamhookError::Config(
                "pipeline.workers must be between 1 and 64".to_string(),
            )
            .into());
        }

        if self.pipeline.shutdown_timeout_ms == 0 {
            return Err(StreamhookError::Config(
                "pipeline.shutdown_timeout_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if self.payload.redact_fields.iter().any(|f| f.trim().is_empty()) {
            return Err(StreamhookError::Config(
                "payload.redact_fields cannot contain empty paths".to_string(),
            )
            .into());
        }

        EventFilter::new(self.filter.stages.clone())
            .map_err(|e| StreamhookError::Config(format!("Invalid filter: {}", e)))?;

        Ok(())
    }

    /// Resolved checkpoint location
    pub fn checkpoint_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.checkpoint.path {
            return Ok(path.clone());
        }
        let name = match self.checkpoint.backend {
            CheckpointBackend::File => format!("{}.checkpoint.json", self.subscription),
            CheckpointBackend::Sled => "checkpoints.sled".to_string(),
        };
        Ok(data_dir()?.join(name))
    }

    /// Resolved dead-letter database location
    pub fn dead_letter_path(&self) -> Result<PathBuf> {
        match &self.dead_letter.path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("dead_letters.db")),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            subscription: default_subscription(),
            source: SourceConfig::default(),
            filter: FilterConfig::default(),
            target: TargetConfig::default(),
            payload: PayloadConfig::default(),
            delivery: DeliveryConfig::default(),
            pipeline: PipelineConfig::default(),
            checkpoint: CheckpointConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn data_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("io", "streamhook", "streamhook").ok_or_else(|| {
        StreamhookError::Config("Could not determine data directory".to_string())
    })?;
    Ok(proj_dirs.data_dir().to_path_buf())
}
