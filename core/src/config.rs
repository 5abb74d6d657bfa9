use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DeltaError, Result};

/// Largest block length the patch codec accepts.
pub const MAX_BLOCK_LEN: u32 = 1 << 17;

/// Smallest block length the patch codec accepts.
pub const MIN_BLOCK_LEN: u32 = 64;

/// Delta engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Patch codec settings
    pub codec: CodecConfig,

    /// Maximum number of layer pairs diffed concurrently within one build.
    /// Also bounds how many finished patches wait for their turn in the stream.
    pub max_parallel_diffs: usize,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            max_parallel_diffs: 4,
            log_level: LogLevel::Info,
        }
    }
}

impl DeltaConfig {
    /// Load configuration from a YAML or JSON file (chosen by extension).
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            DeltaError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&data)?,
            _ => serde_yaml::from_str(&data)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_diffs == 0 {
            return Err(DeltaError::ConfigError(
                "max_parallel_diffs must be at least 1".to_string(),
            ));
        }
        self.codec.validate()
    }
}

/// Patch codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Fixed signature block length. `None` picks one from the source size.
    pub block_len: Option<u32>,

    /// zlib level for patch bodies (0-9)
    pub compression_level: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            block_len: None,
            compression_level: 6,
        }
    }
}

impl CodecConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(len) = self.block_len {
            if !(MIN_BLOCK_LEN..=MAX_BLOCK_LEN).contains(&len) {
                return Err(DeltaError::ConfigError(format!(
                    "block_len {} outside {}..={}",
                    len, MIN_BLOCK_LEN, MAX_BLOCK_LEN
                )));
            }
        }
        if self.compression_level > 9 {
            return Err(DeltaError::ConfigError(format!(
                "compression_level {} exceeds 9",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}
