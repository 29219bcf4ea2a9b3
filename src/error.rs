//! Error types for the merge engine

use thiserror::Error;

use crate::aggregation::hyperloglog::SketchError;

/// Main error type for merge operations
#[derive(Error, Debug)]
pub enum MergeError {
    /// Distinct grouping keys exceeded the configured cap
    ///
    /// The merge is aborted with no partial result. The message names the
    /// configured limit so an operator can raise it or narrow the query.
    #[error("Computation exceeds configured row limit [{limit}]")]
    ResourceExhausted {
        /// The configured maximum number of distinct grouping keys
        limit: usize,
    },

    /// Operation not supported by this aggregator or filter variant
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Query is malformed from the engine's point of view
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// An input row carried a value the aggregator cannot consume
    #[error("Malformed input row: {0}")]
    MalformedRow(String),

    /// Sketch encoding error
    #[error("Sketch error: {0}")]
    Sketch(#[from] SketchError),
}

/// Result type alias for merge operations
pub type Result<T> = std::result::Result<T, MergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_exhausted_names_limit() {
        let err = MergeError::ResourceExhausted { limit: 500_000 };
        assert!(err.to_string().contains("500000"));
    }

    #[test]
    fn test_unsupported_display() {
        let err = MergeError::Unsupported("getLong() on a sketch aggregator");
        assert!(err.to_string().contains("getLong"));
    }
}
