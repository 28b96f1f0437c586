//! Per-run processing options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// How oversized text is split into segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMethod {
    /// Fixed token-count windows.
    #[default]
    Simple,
    /// Paragraph and sentence aware packing.
    Semantic,
    /// Separator hierarchy, falling back to finer separators.
    Recursive,
}

/// Options that control how a single run is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    /// Maximum number of segments processed concurrently within a step.
    pub max_parallel_chunks: usize,

    /// Token threshold above which a step's input is segmented.
    pub max_tokens_per_chunk: usize,

    pub segmentation_method: SegmentationMethod,

    /// Write a checkpoint after every step and at the end of the run.
    pub save_checkpoints: bool,

    /// Retry failed task attempts.
    pub auto_retry: bool,

    /// Extra attempts after the first one when `auto_retry` is set.
    pub retry_attempts: u32,

    /// Delay before the first retry; doubles on every further attempt.
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            max_parallel_chunks: 3,
            max_tokens_per_chunk: 2000,
            segmentation_method: SegmentationMethod::Simple,
            save_checkpoints: true,
            auto_retry: true,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl ProcessingOptions {
    /// Check option bounds.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_parallel_chunks == 0 {
            return Err(CoreError::InvalidOptions(
                "max_parallel_chunks must be at least 1".to_string(),
            ));
        }
        if self.max_tokens_per_chunk == 0 {
            return Err(CoreError::InvalidOptions(
                "max_tokens_per_chunk must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Total attempts a task gets under these options.
    pub fn max_attempts(&self) -> u32 {
        if self.auto_retry {
            self.retry_attempts.saturating_add(1)
        } else {
            1
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("retry_delay must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ProcessingOptions::default();
        assert_eq!(opts.max_parallel_chunks, 3);
        assert_eq!(opts.max_tokens_per_chunk, 2000);
        assert!(opts.save_checkpoints);
        assert_eq!(opts.retry_attempts, 3);
        assert_eq!(opts.retry_delay, Duration::from_secs(5));
        assert_eq!(opts.max_attempts(), 4);
    }

    #[test]
    fn test_no_retry_means_single_attempt() {
        let opts = ProcessingOptions {
            auto_retry: false,
            ..Default::default()
        };
        assert_eq!(opts.max_attempts(), 1);
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let opts = ProcessingOptions {
            max_parallel_chunks: 0,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(CoreError::InvalidOptions(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let opts: ProcessingOptions =
            serde_json::from_str(r#"{"max_tokens_per_chunk": 500, "retry_delay": 0.5}"#).unwrap();
        assert_eq!(opts.max_tokens_per_chunk, 500);
        assert_eq!(opts.retry_delay, Duration::from_millis(500));
        assert_eq!(opts.max_parallel_chunks, 3);
        assert_eq!(opts.segmentation_method, SegmentationMethod::Simple);
    }
}
