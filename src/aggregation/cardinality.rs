//! Approximate distinct-count buffer aggregators
//!
//! [`CardinalityBufferAggregator`] hashes raw dimension values into a
//! sketch held in the caller's buffer region; [`SketchMergeBufferAggregator`]
//! is its combining counterpart, folding sketches that partitions already
//! built. Both keep the entire state inside the region and copy it out on
//! decode, so a decoded sketch never aliases the shared buffer.

use xxhash_rust::xxh3::xxh3_64;

use crate::aggregation::hyperloglog::{self, HllSketch, NUM_BYTES};
use crate::aggregation::BufferAggregator;
use crate::error::{MergeError, Result};
use crate::query::row::{Row, Value};

/// Separator for by-row tuple hashing. Cannot occur inside a dimension
/// value, so tuples never collide through concatenation; a missing
/// dimension contributes the empty string, deliberately colliding with an
/// actual empty value.
const TUPLE_SEPARATOR: char = '\u{1}';

/// Distinct-count aggregator over raw dimension values.
///
/// Two input modes reduce to the same register-max primitive: by-row hashes
/// one combined dimension tuple per row, by-value hashes each dimension
/// value independently.
pub struct CardinalityBufferAggregator {
    dimensions: Vec<String>,
    by_row: bool,
}

impl CardinalityBufferAggregator {
    /// Create an aggregator bound to the given dimensions
    pub fn new(dimensions: Vec<String>, by_row: bool) -> Self {
        Self { dimensions, by_row }
    }

    fn hash_row_into(&self, region: &mut [u8], row: &Row) {
        let mut combined = String::new();
        for (i, dimension) in self.dimensions.iter().enumerate() {
            if i > 0 {
                combined.push(TUPLE_SEPARATOR);
            }
            if let Some(value) = row.get(dimension).and_then(Value::as_dimension) {
                combined.push_str(&value);
            }
        }
        hyperloglog::add_hash_into(region, xxh3_64(combined.as_bytes()));
    }

    fn hash_values_into(&self, region: &mut [u8], row: &Row) {
        for dimension in &self.dimensions {
            if let Some(value) = row.get(dimension).and_then(Value::as_dimension) {
                hyperloglog::add_hash_into(region, xxh3_64(value.as_bytes()));
            }
        }
    }
}

impl BufferAggregator for CardinalityBufferAggregator {
    fn init(&self, buf: &mut [u8], offset: usize) {
        hyperloglog::write_empty_into(&mut buf[offset..offset + NUM_BYTES]);
    }

    fn aggregate(&self, buf: &mut [u8], offset: usize, row: &Row) -> Result<()> {
        let region = &mut buf[offset..offset + NUM_BYTES];
        if self.by_row {
            self.hash_row_into(region, row);
        } else {
            self.hash_values_into(region, row);
        }
        Ok(())
    }

    fn get(&self, buf: &[u8], offset: usize) -> Value {
        Value::Sketch(HllSketch::copy_from_region(&buf[offset..offset + NUM_BYTES]))
    }

    fn get_double(&self, _buf: &[u8], _offset: usize) -> Result<f64> {
        Err(MergeError::Unsupported(
            "getDouble() on a cardinality aggregator before finalization",
        ))
    }

    fn get_long(&self, _buf: &[u8], _offset: usize) -> Result<i64> {
        Err(MergeError::Unsupported(
            "getLong() on a cardinality aggregator before finalization",
        ))
    }
}

/// Combining aggregator folding already-built sketches from partition rows
pub struct SketchMergeBufferAggregator {
    field: String,
}

impl SketchMergeBufferAggregator {
    /// Create an aggregator reading sketches from `field`
    pub fn new(field: String) -> Self {
        Self { field }
    }
}

impl BufferAggregator for SketchMergeBufferAggregator {
    fn init(&self, buf: &mut [u8], offset: usize) {
        hyperloglog::write_empty_into(&mut buf[offset..offset + NUM_BYTES]);
    }

    fn aggregate(&self, buf: &mut [u8], offset: usize, row: &Row) -> Result<()> {
        match row.get(&self.field) {
            None => Ok(()),
            Some(Value::Sketch(sketch)) => {
                let region = &mut buf[offset..offset + NUM_BYTES];
                hyperloglog::merge_into(region, sketch.as_bytes())?;
                Ok(())
            }
            Some(_) => Err(MergeError::MalformedRow(format!(
                "field '{}' does not carry a sketch",
                self.field
            ))),
        }
    }

    fn get(&self, buf: &[u8], offset: usize) -> Value {
        Value::Sketch(HllSketch::copy_from_region(&buf[offset..offset + NUM_BYTES]))
    }

    fn get_double(&self, _buf: &[u8], _offset: usize) -> Result<f64> {
        Err(MergeError::Unsupported(
            "getDouble() on a sketch-merge aggregator before finalization",
        ))
    }

    fn get_long(&self, _buf: &[u8], _offset: usize) -> Result<i64> {
        Err(MergeError::Unsupported(
            "getLong() on a sketch-merge aggregator before finalization",
        ))
    }
}
