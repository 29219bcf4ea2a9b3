//! Aggregation functions over buffer-resident state
//!
//! Aggregation state lives in caller-owned byte regions addressed by offset,
//! never in per-key heap objects: an index that tracks millions of grouping
//! keys allocates one arena and hands each aggregator a fixed-size slice of
//! it. [`BufferAggregator`] is the protocol; [`AggregatorSpec`] is the
//! closed family of aggregation kinds, each of which can produce the
//! *combining* variant used when merging already-aggregated partition
//! results.

pub mod cardinality;
pub mod hyperloglog;
pub mod post;

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};
use crate::query::row::{Row, Value};

use cardinality::{CardinalityBufferAggregator, SketchMergeBufferAggregator};

// ============================================================================
// Buffer aggregator protocol
// ============================================================================

/// Aggregation function operating on a byte region at a given offset.
///
/// Implementations are stateless: all mutable state lives in the region.
/// `aggregate` must not allocate on the hot path; `get` must not mutate, and
/// any decoded view that could alias the shared buffer is copied out before
/// it is returned.
pub trait BufferAggregator: Send + Sync {
    /// Write the neutral state into `buf` at `offset`
    fn init(&self, buf: &mut [u8], offset: usize);

    /// Fold the bound input values of `row` into the state in place
    fn aggregate(&self, buf: &mut [u8], offset: usize, row: &Row) -> Result<()>;

    /// Decode the current state without mutating it
    fn get(&self, buf: &[u8], offset: usize) -> Value;

    /// Decode as a double; unsupported for non-numeric kinds
    fn get_double(&self, buf: &[u8], offset: usize) -> Result<f64>;

    /// Decode as a long; unsupported for non-numeric kinds
    fn get_long(&self, buf: &[u8], offset: usize) -> Result<i64>;
}

// ============================================================================
// Aggregator specs
// ============================================================================

/// The closed family of aggregation kinds.
///
/// Every spec can build the [`BufferAggregator`] that realizes it, report
/// its fixed state footprint, and produce its combining variant. Applying
/// [`AggregatorSpec::combining`] twice yields the same spec as applying it
/// once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AggregatorSpec {
    /// Row count
    Count {
        /// Output name
        name: String,
    },

    /// Sum of a long-valued field
    LongSum {
        /// Output name
        name: String,
        /// Input field
        field: String,
    },

    /// Sum of a double-valued field
    DoubleSum {
        /// Output name
        name: String,
        /// Input field
        field: String,
    },

    /// Minimum of a double-valued field
    DoubleMin {
        /// Output name
        name: String,
        /// Input field
        field: String,
    },

    /// Maximum of a double-valued field
    DoubleMax {
        /// Output name
        name: String,
        /// Input field
        field: String,
    },

    /// Approximate distinct count over dimension values.
    ///
    /// `by_row` hashes the combined dimension tuple per row (distinct
    /// combinations); otherwise each dimension value hashes independently
    /// (distinct values).
    Cardinality {
        /// Output name
        name: String,
        /// Dimensions feeding the estimator
        dimensions: Vec<String>,
        /// Hash the combined tuple instead of each value
        by_row: bool,
    },

    /// Merge of already-built sketches (combining form of `Cardinality`)
    SketchMerge {
        /// Output name
        name: String,
        /// Input field carrying sketch values
        field: String,
    },
}

impl AggregatorSpec {
    /// Row-count aggregator
    pub fn count(name: impl Into<String>) -> Self {
        AggregatorSpec::Count { name: name.into() }
    }

    /// Long sum over `field`
    pub fn long_sum(name: impl Into<String>, field: impl Into<String>) -> Self {
        AggregatorSpec::LongSum {
            name: name.into(),
            field: field.into(),
        }
    }

    /// Double sum over `field`
    pub fn double_sum(name: impl Into<String>, field: impl Into<String>) -> Self {
        AggregatorSpec::DoubleSum {
            name: name.into(),
            field: field.into(),
        }
    }

    /// Double minimum over `field`
    pub fn double_min(name: impl Into<String>, field: impl Into<String>) -> Self {
        AggregatorSpec::DoubleMin {
            name: name.into(),
            field: field.into(),
        }
    }

    /// Double maximum over `field`
    pub fn double_max(name: impl Into<String>, field: impl Into<String>) -> Self {
        AggregatorSpec::DoubleMax {
            name: name.into(),
            field: field.into(),
        }
    }

    /// Approximate distinct count over `dimensions`
    pub fn cardinality(
        name: impl Into<String>,
        dimensions: Vec<String>,
        by_row: bool,
    ) -> Self {
        AggregatorSpec::Cardinality {
            name: name.into(),
            dimensions,
            by_row,
        }
    }

    /// Sketch-merge aggregator over `field`
    pub fn sketch_merge(name: impl Into<String>, field: impl Into<String>) -> Self {
        AggregatorSpec::SketchMerge {
            name: name.into(),
            field: field.into(),
        }
    }

    /// Output name of this aggregator
    pub fn name(&self) -> &str {
        match self {
            AggregatorSpec::Count { name }
            | AggregatorSpec::LongSum { name, .. }
            | AggregatorSpec::DoubleSum { name, .. }
            | AggregatorSpec::DoubleMin { name, .. }
            | AggregatorSpec::DoubleMax { name, .. }
            | AggregatorSpec::Cardinality { name, .. }
            | AggregatorSpec::SketchMerge { name, .. } => name,
        }
    }

    /// Fixed size of this aggregator's buffer state in bytes
    pub fn storage_size(&self) -> usize {
        match self {
            AggregatorSpec::Count { .. }
            | AggregatorSpec::LongSum { .. }
            | AggregatorSpec::DoubleSum { .. }
            | AggregatorSpec::DoubleMin { .. }
            | AggregatorSpec::DoubleMax { .. } => 8,
            AggregatorSpec::Cardinality { .. } | AggregatorSpec::SketchMerge { .. } => {
                hyperloglog::NUM_BYTES
            }
        }
    }

    /// The combining variant: an aggregator that folds already-aggregated
    /// outputs (read under this aggregator's own name) instead of raw
    /// inputs. Idempotent.
    pub fn combining(&self) -> AggregatorSpec {
        match self {
            AggregatorSpec::Count { name } => AggregatorSpec::LongSum {
                name: name.clone(),
                field: name.clone(),
            },
            AggregatorSpec::LongSum { name, .. } => AggregatorSpec::LongSum {
                name: name.clone(),
                field: name.clone(),
            },
            AggregatorSpec::DoubleSum { name, .. } => AggregatorSpec::DoubleSum {
                name: name.clone(),
                field: name.clone(),
            },
            AggregatorSpec::DoubleMin { name, .. } => AggregatorSpec::DoubleMin {
                name: name.clone(),
                field: name.clone(),
            },
            AggregatorSpec::DoubleMax { name, .. } => AggregatorSpec::DoubleMax {
                name: name.clone(),
                field: name.clone(),
            },
            AggregatorSpec::Cardinality { name, .. }
            | AggregatorSpec::SketchMerge { name, .. } => AggregatorSpec::SketchMerge {
                name: name.clone(),
                field: name.clone(),
            },
        }
    }

    /// Build the buffer aggregator realizing this spec
    pub fn build(&self) -> Box<dyn BufferAggregator> {
        match self {
            AggregatorSpec::Count { .. } => Box::new(CountBufferAggregator),
            AggregatorSpec::LongSum { field, .. } => Box::new(LongSumBufferAggregator {
                field: field.clone(),
            }),
            AggregatorSpec::DoubleSum { field, .. } => Box::new(DoubleSumBufferAggregator {
                field: field.clone(),
            }),
            AggregatorSpec::DoubleMin { field, .. } => Box::new(DoubleMinMaxBufferAggregator {
                field: field.clone(),
                min: true,
            }),
            AggregatorSpec::DoubleMax { field, .. } => Box::new(DoubleMinMaxBufferAggregator {
                field: field.clone(),
                min: false,
            }),
            AggregatorSpec::Cardinality {
                dimensions, by_row, ..
            } => Box::new(CardinalityBufferAggregator::new(
                dimensions.clone(),
                *by_row,
            )),
            AggregatorSpec::SketchMerge { field, .. } => {
                Box::new(SketchMergeBufferAggregator::new(field.clone()))
            }
        }
    }
}

// ============================================================================
// Fixed-width state codecs
// ============================================================================

pub(crate) fn read_i64(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}

pub(crate) fn write_i64(buf: &mut [u8], offset: usize, value: i64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_f64(buf: &[u8], offset: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    f64::from_le_bytes(bytes)
}

pub(crate) fn write_f64(buf: &mut [u8], offset: usize, value: f64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

// ============================================================================
// Numeric buffer aggregators
// ============================================================================

struct CountBufferAggregator;

impl BufferAggregator for CountBufferAggregator {
    fn init(&self, buf: &mut [u8], offset: usize) {
        write_i64(buf, offset, 0);
    }

    fn aggregate(&self, buf: &mut [u8], offset: usize, _row: &Row) -> Result<()> {
        write_i64(buf, offset, read_i64(buf, offset) + 1);
        Ok(())
    }

    fn get(&self, buf: &[u8], offset: usize) -> Value {
        Value::Long(read_i64(buf, offset))
    }

    fn get_double(&self, buf: &[u8], offset: usize) -> Result<f64> {
        Ok(read_i64(buf, offset) as f64)
    }

    fn get_long(&self, buf: &[u8], offset: usize) -> Result<i64> {
        Ok(read_i64(buf, offset))
    }
}

struct LongSumBufferAggregator {
    field: String,
}

impl BufferAggregator for LongSumBufferAggregator {
    fn init(&self, buf: &mut [u8], offset: usize) {
        write_i64(buf, offset, 0);
    }

    fn aggregate(&self, buf: &mut [u8], offset: usize, row: &Row) -> Result<()> {
        if let Some(value) = row.get(&self.field) {
            let v = value.as_long().ok_or_else(|| {
                MergeError::MalformedRow(format!("field '{}' is not long-valued", self.field))
            })?;
            write_i64(buf, offset, read_i64(buf, offset).wrapping_add(v));
        }
        Ok(())
    }

    fn get(&self, buf: &[u8], offset: usize) -> Value {
        Value::Long(read_i64(buf, offset))
    }

    fn get_double(&self, buf: &[u8], offset: usize) -> Result<f64> {
        Ok(read_i64(buf, offset) as f64)
    }

    fn get_long(&self, buf: &[u8], offset: usize) -> Result<i64> {
        Ok(read_i64(buf, offset))
    }
}

struct DoubleSumBufferAggregator {
    field: String,
}

impl BufferAggregator for DoubleSumBufferAggregator {
    fn init(&self, buf: &mut [u8], offset: usize) {
        write_f64(buf, offset, 0.0);
    }

    fn aggregate(&self, buf: &mut [u8], offset: usize, row: &Row) -> Result<()> {
        if let Some(value) = row.get(&self.field) {
            let v = value.as_double().ok_or_else(|| {
                MergeError::MalformedRow(format!("field '{}' is not double-valued", self.field))
            })?;
            write_f64(buf, offset, read_f64(buf, offset) + v);
        }
        Ok(())
    }

    fn get(&self, buf: &[u8], offset: usize) -> Value {
        Value::Double(read_f64(buf, offset))
    }

    fn get_double(&self, buf: &[u8], offset: usize) -> Result<f64> {
        Ok(read_f64(buf, offset))
    }

    fn get_long(&self, buf: &[u8], offset: usize) -> Result<i64> {
        Ok(read_f64(buf, offset) as i64)
    }
}

/// Min and max share the codec; only the neutral element and fold differ.
struct DoubleMinMaxBufferAggregator {
    field: String,
    min: bool,
}

impl BufferAggregator for DoubleMinMaxBufferAggregator {
    fn init(&self, buf: &mut [u8], offset: usize) {
        let neutral = if self.min {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        };
        write_f64(buf, offset, neutral);
    }

    fn aggregate(&self, buf: &mut [u8], offset: usize, row: &Row) -> Result<()> {
        if let Some(value) = row.get(&self.field) {
            let v = value.as_double().ok_or_else(|| {
                MergeError::MalformedRow(format!("field '{}' is not double-valued", self.field))
            })?;
            let current = read_f64(buf, offset);
            let next = if self.min {
                current.min(v)
            } else {
                current.max(v)
            };
            write_f64(buf, offset, next);
        }
        Ok(())
    }

    fn get(&self, buf: &[u8], offset: usize) -> Value {
        Value::Double(read_f64(buf, offset))
    }

    fn get_double(&self, buf: &[u8], offset: usize) -> Result<f64> {
        Ok(read_f64(buf, offset))
    }

    fn get_long(&self, buf: &[u8], offset: usize) -> Result<i64> {
        Ok(read_f64(buf, offset) as i64)
    }
}
