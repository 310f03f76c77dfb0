use std::path::PathBuf;
use std::fs;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::agent::AgentTimings;
use crate::distributor::{FileTransferStrategy, GIVEN_CHUNK_TIMEOUT};
use crate::error::TransferError;

// Scheduling constants
pub const DEFAULT_TICK_MS: u64 = 1000;
pub const IDLE_TIMEOUT_SECS: u64 = 300;
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
pub const BACKOFF_BASE_MS: u64 = 250;
pub const BACKOFF_MAX_MS: u64 = 16_000;
pub const CHECKSUM_TIMEOUT_SECS: u64 = 60;
pub const VERIFY_CHUNKS: bool = true;

// File naming constants
pub const DOWNLOAD_PREFIX: &str = ".";
pub const DOWNLOAD_EXTENSION: &str = ".swarmpart";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub incoming_directory: String,
    pub resume_directory: String,
    pub strategy: FileTransferStrategy,
    pub default_tick_ms: u64,
    pub idle_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub given_chunk_timeout_secs: u64,
    pub verify_chunks: bool,
    pub checksum_timeout_secs: u64,
    pub download_prefix: String,
    pub download_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber` filter directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Config {
    pub fn load_or_create(path: &PathBuf) -> Result<Self, TransferError> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(TransferError::Io)?;

            let config: Self = toml::from_str(&content)
                .map_err(TransferError::TomlDeserialization)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &PathBuf) -> Result<(), TransferError> {
        let content = toml::to_string_pretty(self)
            .map_err(TransferError::TomlSerialization)?;

        fs::write(path, content)
            .map_err(TransferError::Io)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        let transfer = &self.transfer;
        if transfer.default_tick_ms == 0 {
            return Err(TransferError::ConfigError("default_tick_ms must be greater than 0".to_string()));
        }
        if transfer.backoff_base_ms > transfer.backoff_max_ms {
            return Err(TransferError::ConfigError(format!(
                "backoff_base_ms ({}) is greater than backoff_max_ms ({})",
                transfer.backoff_base_ms, transfer.backoff_max_ms
            )));
        }
        if transfer.download_prefix.contains(['/', '\\']) || transfer.download_extension.contains(['/', '\\']) {
            return Err(TransferError::ConfigError("download file name parts cannot contain path separators".to_string()));
        }
        Ok(())
    }
}

impl TransferConfig {
    pub fn default_tick(&self) -> Duration {
        Duration::from_millis(self.default_tick_ms)
    }

    pub fn given_chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.given_chunk_timeout_secs)
    }

    pub fn timings(&self) -> AgentTimings {
        AgentTimings {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            checksum_timeout: Duration::from_secs(self.checksum_timeout_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            verify_chunks: self.verify_chunks,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            incoming_directory: "./incoming".to_string(),
            resume_directory: "./resume".to_string(),
            strategy: FileTransferStrategy::default(),
            default_tick_ms: DEFAULT_TICK_MS,
            idle_timeout_secs: IDLE_TIMEOUT_SECS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            backoff_base_ms: BACKOFF_BASE_MS,
            backoff_max_ms: BACKOFF_MAX_MS,
            given_chunk_timeout_secs: GIVEN_CHUNK_TIMEOUT.as_secs(),
            verify_chunks: VERIFY_CHUNKS,
            checksum_timeout_secs: CHECKSUM_TIMEOUT_SECS,
            download_prefix: DOWNLOAD_PREFIX.to_string(),
            download_extension: DOWNLOAD_EXTENSION.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}
