//! Configuration for splitfile inserts
//!
//! This module provides the per-insert context: redundancy scheme,
//! segment sizing, retry policy and transfer concurrency.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backends::reed_solomon::MAX_BLOCKS_PER_SEGMENT;
use crate::codec::SplitfileAlgorithm;

/// Default number of data blocks per segment
pub const DEFAULT_SEGMENT_DATA_BLOCKS: i32 = 128;

/// Default number of check blocks per full segment
pub const DEFAULT_SEGMENT_CHECK_BLOCKS: i32 = 128;

/// Segment size that disables segmentation entirely
pub const SEGMENTATION_DISABLED: i32 = -1;

/// Main configuration for a splitfile insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertConfig {
    /// Redundancy scheme applied to every segment
    pub splitfile_algorithm: SplitfileAlgorithm,
    /// Target data blocks per segment, or -1 for a single segment
    pub segment_data_blocks: i32,
    /// Target check blocks per full segment
    pub segment_check_blocks: i32,
    /// Retries for a block after a non-fatal insert error
    pub max_insert_retries: u32,
    /// Pause between retries of the same block
    pub retry_backoff: Duration,
    /// Block transfers allowed in flight across all segments of one insert
    pub max_concurrent_inserts: usize,
}

impl InsertConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration without any check blocks
    pub fn non_redundant() -> Self {
        Self {
            splitfile_algorithm: SplitfileAlgorithm::NonRedundant,
            ..Self::default()
        }
    }

    /// Set the redundancy scheme
    pub fn with_algorithm(mut self, algorithm: SplitfileAlgorithm) -> Self {
        self.splitfile_algorithm = algorithm;
        self
    }

    /// Set target data/check blocks per segment
    pub fn with_segment_sizes(mut self, data_blocks: i32, check_blocks: i32) -> Self {
        self.segment_data_blocks = data_blocks;
        self.segment_check_blocks = check_blocks;
        self
    }

    /// Set the retry policy
    pub fn with_retries(mut self, max_insert_retries: u32, retry_backoff: Duration) -> Self {
        self.max_insert_retries = max_insert_retries;
        self.retry_backoff = retry_backoff;
        self
    }

    /// Set the transfer concurrency
    pub fn with_max_concurrent_inserts(mut self, max: usize) -> Self {
        self.max_concurrent_inserts = max;
        self
    }

    /// Check block target actually used for segments
    ///
    /// Zero when the scheme produces no check blocks.
    pub fn effective_check_segment_size(&self) -> i32 {
        match self.splitfile_algorithm {
            SplitfileAlgorithm::NonRedundant => 0,
            SplitfileAlgorithm::OnionStandard => self.segment_check_blocks,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let max = MAX_BLOCKS_PER_SEGMENT as i32;
        if self.segment_data_blocks != SEGMENTATION_DISABLED && self.segment_data_blocks <= 0 {
            anyhow::bail!("Segment data blocks must be positive or -1");
        }
        if self.segment_data_blocks > max {
            anyhow::bail!("Segment data blocks cannot exceed {}", max);
        }
        if self.splitfile_algorithm == SplitfileAlgorithm::OnionStandard {
            if self.segment_check_blocks <= 0 {
                anyhow::bail!("Segment check blocks must be greater than 0");
            }
            if self.segment_check_blocks > max {
                anyhow::bail!("Segment check blocks cannot exceed {}", max);
            }
        }
        if self.max_concurrent_inserts == 0 {
            anyhow::bail!("Concurrent inserts must be greater than 0");
        }
        Ok(())
    }

    /// Load and validate a configuration from JSON
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid insert configuration")?;
        config.validate().context("Invalid insert configuration")?;
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize insert configuration")
    }
}

impl Default for InsertConfig {
    fn default() -> Self {
        Self {
            splitfile_algorithm: SplitfileAlgorithm::OnionStandard,
            segment_data_blocks: DEFAULT_SEGMENT_DATA_BLOCKS,
            segment_check_blocks: DEFAULT_SEGMENT_CHECK_BLOCKS,
            max_insert_retries: 10,
            retry_backoff: Duration::from_millis(250),
            max_concurrent_inserts: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = InsertConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_check_segment_size(), 128);
    }

    #[test]
    fn test_config_non_redundant() {
        let config = InsertConfig::non_redundant();
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_check_segment_size(), 0);
    }

    #[test]
    fn test_config_validation() {
        let mut config = InsertConfig::default();

        config.segment_data_blocks = 0;
        assert!(config.validate().is_err());

        config.segment_data_blocks = SEGMENTATION_DISABLED;
        assert!(config.validate().is_ok());

        config.segment_data_blocks = 40_000;
        assert!(config.validate().is_err());

        config.segment_data_blocks = 128;
        config.segment_check_blocks = 0;
        assert!(config.validate().is_err());

        // Check size is irrelevant without redundancy
        config.splitfile_algorithm = SplitfileAlgorithm::NonRedundant;
        assert!(config.validate().is_ok());

        config.max_concurrent_inserts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = InsertConfig::default()
            .with_segment_sizes(64, 32)
            .with_retries(3, Duration::from_millis(10));

        let json = config.to_json().unwrap();
        let restored = InsertConfig::from_json(&json).unwrap();
        assert_eq!(restored, config);

        let broken = json.replace("64", "0");
        assert!(InsertConfig::from_json(&broken).is_err());
    }
}
