//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use chainrun_core::ProcessingOptions;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for one task attempt (seconds).
    pub task_timeout_secs: u64,

    /// Worker pool size for batch execution.
    pub max_concurrent_tasks: usize,

    /// Checkpoint directory; checkpoints stay in memory when unset.
    pub checkpoint_dir: Option<PathBuf>,

    /// Checkpoint content longer than this many bytes is stored as a blob.
    pub externalize_threshold_bytes: usize,

    /// Cost charged per thousand estimated tokens.
    pub cost_per_1k_tokens: f64,

    /// Joins merged segment outputs.
    pub segment_separator: String,

    /// Options used when a run does not provide its own.
    pub processing: ProcessingOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: 300,
            max_concurrent_tasks: 4,
            checkpoint_dir: None,
            externalize_threshold_bytes: 64 * 1024,
            cost_per_1k_tokens: 0.0,
            segment_separator: "\n\n".to_string(),
            processing: ProcessingOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Load a TOML config file. Missing keys fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "task_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        self.processing
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.task_timeout(), Duration::from_secs(300));
        assert!(config.checkpoint_dir.is_none());
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
task_timeout_secs = 30
checkpoint_dir = "/tmp/chainrun"

[processing]
max_parallel_chunks = 8
segmentation_method = "recursive"
"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.task_timeout_secs, 30);
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.checkpoint_dir, Some(PathBuf::from("/tmp/chainrun")));
        assert_eq!(config.processing.max_parallel_chunks, 8);
        assert_eq!(config.processing.max_tokens_per_chunk, 2000);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "task_timeout_secs = 0").unwrap();
        assert!(matches!(
            EngineConfig::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            EngineConfig::from_file("/nonexistent/chainrun.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
