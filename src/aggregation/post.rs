//! Post-aggregators
//!
//! Pure computations over a fully-aggregated output row, applied while the
//! grouping index is iterated. They read dimension and aggregator outputs
//! by name and add one more named value.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::query::row::Value;

/// Arithmetic operator for [`PostAggregatorSpec::Arithmetic`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArithmeticOp {
    /// Addition
    Plus,
    /// Subtraction
    Minus,
    /// Multiplication
    Times,
    /// Division; dividing by zero yields zero
    Div,
}

impl ArithmeticOp {
    fn apply(&self, lhs: f64, rhs: f64) -> f64 {
        match self {
            ArithmeticOp::Plus => lhs + rhs,
            ArithmeticOp::Minus => lhs - rhs,
            ArithmeticOp::Times => lhs * rhs,
            ArithmeticOp::Div => {
                if rhs == 0.0 {
                    0.0
                } else {
                    lhs / rhs
                }
            }
        }
    }
}

/// One post-aggregation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PostAggregatorSpec {
    /// Left-fold of operand values under one arithmetic operator
    Arithmetic {
        /// Output name
        name: String,
        /// Operator
        op: ArithmeticOp,
        /// Operands, evaluated in order
        fields: Vec<PostAggregatorSpec>,
    },

    /// Read an existing output value by name.
    ///
    /// A sketch-valued field projects to its estimate, which is how
    /// distinct counts become usable in arithmetic.
    FieldAccess {
        /// Output name
        name: String,
        /// Field to read
        field: String,
    },

    /// A constant
    Constant {
        /// Output name
        name: String,
        /// The value
        value: f64,
    },
}

impl PostAggregatorSpec {
    /// Arithmetic post-aggregator
    pub fn arithmetic(
        name: impl Into<String>,
        op: ArithmeticOp,
        fields: Vec<PostAggregatorSpec>,
    ) -> Self {
        PostAggregatorSpec::Arithmetic {
            name: name.into(),
            op,
            fields,
        }
    }

    /// Field access operand
    pub fn field_access(field: impl Into<String>) -> Self {
        let field = field.into();
        PostAggregatorSpec::FieldAccess {
            name: field.clone(),
            field,
        }
    }

    /// Constant operand
    pub fn constant(name: impl Into<String>, value: f64) -> Self {
        PostAggregatorSpec::Constant {
            name: name.into(),
            value,
        }
    }

    /// Output name of this post-aggregator
    pub fn name(&self) -> &str {
        match self {
            PostAggregatorSpec::Arithmetic { name, .. }
            | PostAggregatorSpec::FieldAccess { name, .. }
            | PostAggregatorSpec::Constant { name, .. } => name,
        }
    }

    /// Compute this post-aggregation over an output row's values
    pub fn compute(&self, event: &HashMap<String, Value>) -> Value {
        Value::Double(self.compute_double(event))
    }

    fn compute_double(&self, event: &HashMap<String, Value>) -> f64 {
        match self {
            PostAggregatorSpec::Constant { value, .. } => *value,
            PostAggregatorSpec::FieldAccess { field, .. } => event
                .get(field)
                .and_then(Value::as_double)
                .unwrap_or(0.0),
            PostAggregatorSpec::Arithmetic { op, fields, .. } => {
                let mut operands = fields.iter().map(|f| f.compute_double(event));
                let first = operands.next().unwrap_or(0.0);
                operands.fold(first, |acc, v| op.apply(acc, v))
            }
        }
    }
}
