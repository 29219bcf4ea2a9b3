//! Row and value model
//!
//! A [`Row`] is one merged (or partial) result: a timestamp plus a mapping
//! from output name to value. Dimension outputs and aggregator outputs share
//! the same namespace, exactly as they do on the wire between partitions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::aggregation::hyperloglog::HllSketch;

// ============================================================================
// Value
// ============================================================================

/// A single cell value inside a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// 64-bit signed integer
    Long(i64),

    /// 64-bit float
    Double(f64),

    /// String (dimension values)
    Str(String),

    /// Partially-aggregated distinct-count sketch
    ///
    /// Carried between partitions and the merge stage; finalized to a
    /// [`Value::Double`] estimate by the post-merge manipulation hook.
    Sketch(HllSketch),
}

impl Value {
    /// Numeric projection as a double.
    ///
    /// Strings parse if they look numeric; a sketch projects to its
    /// estimate, matching how post-aggregations finalize distinct counts.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Long(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Str(s) => s.parse().ok(),
            Value::Sketch(sketch) => Some(sketch.estimate()),
        }
    }

    /// Numeric projection as a long
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            Value::Double(v) => Some(*v as i64),
            Value::Str(s) => s.parse().ok(),
            Value::Sketch(_) => None,
        }
    }

    /// String form usable as a grouping dimension value.
    ///
    /// Sketches have no dimension form.
    pub fn as_dimension(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Long(v) => Some(v.to_string()),
            Value::Double(v) => Some(v.to_string()),
            Value::Sketch(_) => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

// ============================================================================
// Row
// ============================================================================

/// One result row: bucket timestamp plus named values.
///
/// Immutable once constructed; the merge engine builds new rows rather than
/// mutating ones it has handed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    timestamp: i64,
    event: HashMap<String, Value>,
}

impl Row {
    /// Create a row from a timestamp (epoch millis) and its values
    pub fn new(timestamp: i64, event: HashMap<String, Value>) -> Self {
        Self { timestamp, event }
    }

    /// Bucket timestamp in epoch milliseconds
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Look up a value by output name (case-sensitive)
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.event.get(name)
    }

    /// All named values
    pub fn event(&self) -> &HashMap<String, Value> {
        &self.event
    }

    /// Decompose into timestamp and value map
    pub fn into_parts(self) -> (i64, HashMap<String, Value>) {
        (self.timestamp, self.event)
    }
}

/// Convenience constructor for tests and in-memory sources
pub fn row(timestamp: i64, values: Vec<(&str, Value)>) -> Row {
    Row::new(
        timestamp,
        values
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}
