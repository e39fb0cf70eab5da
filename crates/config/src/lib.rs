//! Configuration loading, validation, and management for Attune.
//!
//! Loads configuration from `~/.attune/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.attune/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Conversation ledger configuration
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Feedback example curation configuration
    #[serde(default)]
    pub curator: CuratorConfig,

    /// Context assembly configuration
    #[serde(default)]
    pub assembler: AssemblerConfig,

    /// External inference service configuration
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL (pass `sqlite::memory:` for ephemeral runs)
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_database_url() -> String {
    "sqlite://attune.db".into()
}
fn default_pool_size() -> u32 {
    4
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// How long a ledger survives after its last write
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Summarize once every N appended messages
    #[serde(default = "default_summarize_every")]
    pub summarize_every: u32,

    /// How many of the most recent messages feed the summarizer
    #[serde(default = "default_summary_source_window")]
    pub summary_source_window: u32,

    /// Default recent-history window for context assembly
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,

    /// How many times a conflicted append is retried before surfacing
    #[serde(default = "default_append_retries")]
    pub append_retries: u32,
}

fn default_retention_days() -> u32 {
    30
}
fn default_summarize_every() -> u32 {
    20
}
fn default_summary_source_window() -> u32 {
    100
}
fn default_recent_window() -> usize {
    10
}
fn default_append_retries() -> u32 {
    5
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            summarize_every: default_summarize_every(),
            summary_source_window: default_summary_source_window(),
            recent_window: default_recent_window(),
            append_retries: default_append_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuratorConfig {
    /// Default few-shot example count per assembled request
    #[serde(default = "default_ranked_limit")]
    pub ranked_limit: usize,

    /// Default export size
    #[serde(default = "default_export_limit")]
    pub export_limit: usize,
}

fn default_ranked_limit() -> usize {
    5
}
fn default_export_limit() -> usize {
    100
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            ranked_limit: default_ranked_limit(),
            export_limit: default_export_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblerConfig {
    /// Overall deadline for one turn's context assembly
    #[serde(default = "default_turn_deadline_secs")]
    pub turn_deadline_secs: u64,

    /// Buffered audit writer queue depth
    #[serde(default = "default_audit_buffer")]
    pub audit_buffer: usize,

    /// Retries per audit record before logging a terminal failure
    #[serde(default = "default_audit_retries")]
    pub audit_retries: u32,
}

fn default_turn_deadline_secs() -> u64 {
    30
}
fn default_audit_buffer() -> usize {
    256
}
fn default_audit_retries() -> u32 {
    3
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            turn_deadline_secs: default_turn_deadline_secs(),
            audit_buffer: default_audit_buffer(),
            audit_retries: default_audit_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Base URL of the external inference service
    #[serde(default = "default_inference_url")]
    pub base_url: String,

    /// Request timeout
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_inference_url() -> String {
    "http://localhost:8001".into()
}
fn default_inference_timeout_secs() -> u64 {
    120
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_inference_url(),
            timeout_secs: default_inference_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.attune/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `ATTUNE_DATABASE_URL`
    /// - `ATTUNE_INFERENCE_URL`
    /// - `ATTUNE_PORT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if let Ok(url) = std::env::var("ATTUNE_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(url) = std::env::var("ATTUNE_INFERENCE_URL") {
            config.inference.base_url = url;
        }
        if let Ok(port) = std::env::var("ATTUNE_PORT") {
            config.gateway.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("ATTUNE_PORT is not a port number: {port}"))
            })?;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".attune")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.summarize_every == 0 {
            return Err(ConfigError::ValidationError(
                "ledger.summarize_every must be at least 1".into(),
            ));
        }
        if self.ledger.retention_days == 0 {
            return Err(ConfigError::ValidationError(
                "ledger.retention_days must be at least 1".into(),
            ));
        }
        if self.ledger.append_retries == 0 {
            return Err(ConfigError::ValidationError(
                "ledger.append_retries must be at least 1".into(),
            ));
        }
        if self.assembler.turn_deadline_secs == 0 {
            return Err(ConfigError::ValidationError(
                "assembler.turn_deadline_secs must be at least 1".into(),
            ));
        }
        if self.curator.ranked_limit == 0 {
            return Err(ConfigError::ValidationError(
                "curator.ranked_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Generate a default config TOML string (for the `onboard` command).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            ledger: LedgerConfig::default(),
            curator: CuratorConfig::default(),
            assembler: AssemblerConfig::default(),
            inference: InferenceConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
