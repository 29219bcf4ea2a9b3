//! Configuration for the merge engine
//!
//! Engine-wide knobs with serde support and sensible defaults, so a config
//! file section can be deserialized directly into [`MergeConfig`].

use serde::{Deserialize, Serialize};

/// Configuration for group-by result merging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Maximum number of distinct grouping keys a single merge may hold.
    ///
    /// Exceeding this aborts the merge with
    /// [`MergeError::ResourceExhausted`](crate::error::MergeError::ResourceExhausted).
    #[serde(default = "default_max_intermediate_rows")]
    pub max_intermediate_rows: usize,

    /// Period, in milliseconds, used to chunk query intervals before the
    /// merge. Zero disables chunking.
    #[serde(default)]
    pub chunk_period_ms: i64,

    /// Run partition sub-queries concurrently when the result source
    /// supports it. Off by default; the sequential path is always correct.
    #[serde(default)]
    pub parallel_merge: bool,

    /// Worker threads for the parallel accumulation path
    #[serde(default = "default_merge_workers")]
    pub merge_workers: usize,
}

fn default_max_intermediate_rows() -> usize {
    500_000
}

fn default_merge_workers() -> usize {
    num_cpus::get()
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_intermediate_rows: default_max_intermediate_rows(),
            chunk_period_ms: 0,
            parallel_merge: false,
            merge_workers: default_merge_workers(),
        }
    }
}

impl MergeConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the distinct grouping key cap
    pub fn with_max_intermediate_rows(mut self, max: usize) -> Self {
        self.max_intermediate_rows = max;
        self
    }

    /// Set the interval chunking period in milliseconds
    pub fn with_chunk_period_ms(mut self, period_ms: i64) -> Self {
        self.chunk_period_ms = period_ms;
        self
    }

    /// Enable the parallel accumulation path
    pub fn with_parallel_merge(mut self, enabled: bool) -> Self {
        self.parallel_merge = enabled;
        self
    }

    /// Set the worker count for parallel accumulation
    pub fn with_merge_workers(mut self, workers: usize) -> Self {
        self.merge_workers = workers.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MergeConfig::default();
        assert_eq!(config.max_intermediate_rows, 500_000);
        assert_eq!(config.chunk_period_ms, 0);
        assert!(!config.parallel_merge);
        assert!(config.merge_workers >= 1);
    }

    #[test]
    fn test_deserialize_empty_uses_defaults() {
        let config: MergeConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_intermediate_rows, 500_000);
        assert!(!config.parallel_merge);
    }

    #[test]
    fn test_deserialize_partial_override() {
        let config: MergeConfig = toml::from_str("max_intermediate_rows = 1000").unwrap();
        assert_eq!(config.max_intermediate_rows, 1000);
        assert_eq!(config.chunk_period_ms, 0);
    }

    #[test]
    fn test_builder() {
        let config = MergeConfig::new()
            .with_max_intermediate_rows(10)
            .with_chunk_period_ms(3_600_000)
            .with_parallel_merge(true)
            .with_merge_workers(4);
        assert_eq!(config.max_intermediate_rows, 10);
        assert_eq!(config.chunk_period_ms, 3_600_000);
        assert!(config.parallel_merge);
        assert_eq!(config.merge_workers, 4);
    }
}
