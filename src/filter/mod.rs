//! Dimension filters
//!
//! A filter turns a value-level predicate into one of two evaluation
//! strategies: an index-assisted union of precomputed bitmaps, or a per-row
//! value matcher for contexts without a bitmap index. The two must select
//! identical row sets over the same data. A third, generic row-wise entry
//! point exists on the trait for filter variants that can evaluate against
//! arbitrary column selectors; the predicate filter does not support it and
//! fails fast rather than silently degrading.

use std::fmt;
use std::sync::Arc;

use crate::error::{MergeError, Result};
use crate::index::bitmap::{BitmapIndexSelector, RowBitmap};
use crate::query::FilterSpec;

/// Value-level predicate over dimension values
pub type StringPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Per-row matcher produced for row-wise scans
pub trait RowMatcher: Send + Sync {
    /// Whether the row at `ordinal` matches
    fn matches(&self, ordinal: u32) -> bool;
}

/// Builds per-row matchers bound to (dimension, predicate).
///
/// Implemented by scan contexts that can resolve a row ordinal to its
/// dimension values.
pub trait ValueMatcherFactory {
    /// Build a matcher testing `predicate` against `dimension`'s value of
    /// each candidate row
    fn value_matcher(&self, dimension: &str, predicate: StringPredicate) -> Box<dyn RowMatcher>;
}

/// A dimension filter, polymorphic over evaluation strategy
pub trait Filter {
    /// Index-assisted evaluation: the union of bitmaps of all dictionary
    /// values satisfying the filter. Degenerate inputs (empty dictionary,
    /// absent predicate) resolve to the empty bitmap, never an error.
    fn bitmap_index(&self, selector: &dyn BitmapIndexSelector) -> RowBitmap;

    /// Matcher-only fallback for contexts without a bitmap index
    fn value_matcher(&self, factory: &dyn ValueMatcherFactory) -> Box<dyn RowMatcher>;

    /// Generic row-wise evaluation against arbitrary column selectors.
    ///
    /// Unsupported by value-level filters; fails fast.
    fn row_scan_matcher(&self) -> Result<Box<dyn RowMatcher>>;
}

// ============================================================================
// Dimension predicate filter
// ============================================================================

/// Filter matching rows whose `dimension` value satisfies a predicate
#[derive(Clone)]
pub struct DimensionPredicateFilter {
    dimension: String,
    predicate: Option<StringPredicate>,
}

impl DimensionPredicateFilter {
    /// Create a filter from a dimension name and predicate
    pub fn new(dimension: impl Into<String>, predicate: StringPredicate) -> Self {
        Self {
            dimension: dimension.into(),
            predicate: Some(predicate),
        }
    }

    /// A filter with no predicate: matches nothing by policy
    pub fn without_predicate(dimension: impl Into<String>) -> Self {
        Self {
            dimension: dimension.into(),
            predicate: None,
        }
    }

    /// Equality filter from a query-level [`FilterSpec`]
    pub fn from_spec(spec: &FilterSpec) -> Self {
        let expected = spec.value.clone();
        Self::new(spec.dimension.clone(), Arc::new(move |v| v == expected))
    }

    /// The dimension this filter applies to
    pub fn dimension(&self) -> &str {
        &self.dimension
    }
}

impl fmt::Debug for DimensionPredicateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DimensionPredicateFilter")
            .field("dimension", &self.dimension)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Filter for DimensionPredicateFilter {
    fn bitmap_index(&self, selector: &dyn BitmapIndexSelector) -> RowBitmap {
        let values = selector.distinct_values(&self.dimension);
        let predicate = match &self.predicate {
            Some(p) if !values.is_empty() => p,
            _ => return selector.empty_bitmap(),
        };
        RowBitmap::union_all(
            values
                .iter()
                .filter(|value| predicate(value.as_str()))
                .map(|value| selector.bitmap(&self.dimension, value)),
        )
    }

    fn value_matcher(&self, factory: &dyn ValueMatcherFactory) -> Box<dyn RowMatcher> {
        match &self.predicate {
            Some(predicate) => factory.value_matcher(&self.dimension, Arc::clone(predicate)),
            None => Box::new(MatchNone),
        }
    }

    fn row_scan_matcher(&self) -> Result<Box<dyn RowMatcher>> {
        Err(MergeError::Unsupported(
            "row-wise evaluation on a dimension predicate filter",
        ))
    }
}

/// Matcher that never matches; the degenerate-predicate fallback
struct MatchNone;

impl RowMatcher for MatchNone {
    fn matches(&self, _ordinal: u32) -> bool {
        false
    }
}
