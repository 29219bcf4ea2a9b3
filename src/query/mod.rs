//! Group-by query model
//!
//! The immutable description of one group-by request: datasource, grouping
//! dimensions, aggregators, post-aggregators, intervals, bucket granularity,
//! optional filter, per-query context, and an optional limit/sort spec.
//! Context overrides never mutate; they produce a new copy.

pub mod granularity;
pub mod row;

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::aggregation::post::PostAggregatorSpec;
use crate::aggregation::AggregatorSpec;
use crate::query::granularity::Granularity;
use crate::query::row::Row;

// ============================================================================
// Dimensions and intervals
// ============================================================================

/// One grouping dimension: the column to read and the output name to emit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionSpec {
    /// Column name in the input rows
    pub dimension: String,
    /// Name under which the value appears in output rows
    pub output_name: String,
}

impl DimensionSpec {
    /// Dimension with an explicit output name
    pub fn new(dimension: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            dimension: dimension.into(),
            output_name: output_name.into(),
        }
    }

    /// Identity renaming projection: output name equals the dimension name
    pub fn identity(dimension: impl Into<String>) -> Self {
        let dimension = dimension.into();
        Self {
            output_name: dimension.clone(),
            dimension,
        }
    }
}

/// Half-open time interval `[start, end)` in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    /// Inclusive start
    pub start: i64,
    /// Exclusive end
    pub end: i64,
}

impl Interval {
    /// Create an interval; `end` is clamped to at least `start`
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Interval length in whole minutes
    pub fn minutes(&self) -> i64 {
        chrono::Duration::milliseconds(self.end - self.start).num_minutes()
    }

    /// Split into consecutive sub-intervals of at most `period_ms`
    pub fn chunked(&self, period_ms: i64) -> Vec<Interval> {
        if period_ms <= 0 || self.end - self.start <= period_ms {
            return vec![*self];
        }
        let mut chunks = Vec::new();
        let mut start = self.start;
        while start < self.end {
            let end = (start + period_ms).min(self.end);
            chunks.push(Interval { start, end });
            start = end;
        }
        chunks
    }
}

// ============================================================================
// Limit / sort spec
// ============================================================================

/// Sort direction for an order-by column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Smallest first
    Ascending,
    /// Largest first
    Descending,
}

/// One order-by column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderByColumn {
    /// Output name to sort on (dimension or aggregator)
    pub column: String,
    /// Sort direction
    pub direction: SortDirection,
}

impl OrderByColumn {
    /// Ascending order on a column
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Ascending,
        }
    }

    /// Descending order on a column
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// Limit specification applied after post-aggregation.
///
/// Without order-by columns the limit streams; with them the merged
/// sequence is materialized for global ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    /// Order-by columns, highest priority first
    #[serde(default)]
    pub columns: Vec<OrderByColumn>,
    /// Maximum number of rows to emit
    pub limit: usize,
}

impl LimitSpec {
    /// Plain limit with no ordering
    pub fn limit(limit: usize) -> Self {
        Self {
            columns: Vec::new(),
            limit,
        }
    }

    /// Limit with ordering columns
    pub fn ordered(columns: Vec<OrderByColumn>, limit: usize) -> Self {
        Self { columns, limit }
    }

    /// Apply this spec to a merged row sequence
    pub fn apply(
        &self,
        rows: Box<dyn Iterator<Item = Row> + Send>,
    ) -> Box<dyn Iterator<Item = Row> + Send> {
        if self.columns.is_empty() {
            return Box::new(rows.take(self.limit));
        }
        // Global ranking needs the full sequence in memory.
        let mut materialized: Vec<Row> = rows.collect();
        let columns = self.columns.clone();
        materialized.sort_by(|a, b| compare_rows(a, b, &columns));
        materialized.truncate(self.limit);
        Box::new(materialized.into_iter())
    }
}

fn compare_rows(a: &Row, b: &Row, columns: &[OrderByColumn]) -> Ordering {
    for col in columns {
        let ord = compare_values(a.get(&col.column), b.get(&col.column));
        let ord = match col.direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn compare_values(
    a: Option<&crate::query::row::Value>,
    b: Option<&crate::query::row::Value>,
) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.as_double(), b.as_double()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a
                .as_dimension()
                .unwrap_or_default()
                .cmp(&b.as_dimension().unwrap_or_default()),
        },
    }
}

// ============================================================================
// Filter spec
// ============================================================================

/// Value-level dimension filter carried on the query.
///
/// Opaque to the merge path; row selection consumes it upstream by turning
/// it into a [`DimensionPredicateFilter`](crate::filter::DimensionPredicateFilter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Dimension the predicate applies to
    pub dimension: String,
    /// Value the dimension must equal
    pub value: String,
}

// ============================================================================
// GroupByQuery
// ============================================================================

/// Immutable group-by query description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByQuery {
    data_source: String,
    dimensions: Vec<DimensionSpec>,
    aggregators: Vec<AggregatorSpec>,
    #[serde(default)]
    post_aggregators: Vec<PostAggregatorSpec>,
    intervals: Vec<Interval>,
    granularity: Granularity,
    #[serde(default)]
    filter: Option<FilterSpec>,
    #[serde(default)]
    context: HashMap<String, String>,
    #[serde(default)]
    limit_spec: Option<LimitSpec>,
}

impl GroupByQuery {
    /// Start building a query against a datasource
    pub fn builder(data_source: impl Into<String>) -> GroupByQueryBuilder {
        GroupByQueryBuilder {
            query: GroupByQuery {
                data_source: data_source.into(),
                dimensions: Vec::new(),
                aggregators: Vec::new(),
                post_aggregators: Vec::new(),
                intervals: Vec::new(),
                granularity: Granularity::All,
                filter: None,
                context: HashMap::new(),
                limit_spec: None,
            },
        }
    }

    /// Datasource identifier
    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    /// Grouping dimension specs, in output order
    pub fn dimensions(&self) -> &[DimensionSpec] {
        &self.dimensions
    }

    /// Aggregator specs
    pub fn aggregators(&self) -> &[AggregatorSpec] {
        &self.aggregators
    }

    /// Post-aggregator specs
    pub fn post_aggregators(&self) -> &[PostAggregatorSpec] {
        &self.post_aggregators
    }

    /// Query intervals
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Bucket granularity
    pub fn granularity(&self) -> &Granularity {
        &self.granularity
    }

    /// Optional dimension filter
    pub fn filter(&self) -> Option<&FilterSpec> {
        self.filter.as_ref()
    }

    /// Whether a filter is present (metric dimension)
    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Per-query context
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Read a boolean context flag, with a default when absent or unparsable
    pub fn context_bool(&self, key: &str, default: bool) -> bool {
        self.context
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Optional limit/sort spec
    pub fn limit_spec(&self) -> Option<&LimitSpec> {
        self.limit_spec.as_ref()
    }

    /// Copy of this query with the given context entries overridden
    pub fn with_context_overrides<I, K, V>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut query = self.clone();
        query
            .context
            .extend(overrides.into_iter().map(|(k, v)| (k.into(), v.into())));
        query
    }

    /// Copy of this query with different intervals (interval chunking)
    pub fn with_intervals(&self, intervals: Vec<Interval>) -> Self {
        let mut query = self.clone();
        query.intervals = intervals;
        query
    }
}

/// Builder for [`GroupByQuery`]
#[derive(Debug)]
pub struct GroupByQueryBuilder {
    query: GroupByQuery,
}

impl GroupByQueryBuilder {
    /// Add a grouping dimension
    pub fn dimension(mut self, spec: DimensionSpec) -> Self {
        self.query.dimensions.push(spec);
        self
    }

    /// Add an aggregator
    pub fn aggregator(mut self, spec: AggregatorSpec) -> Self {
        self.query.aggregators.push(spec);
        self
    }

    /// Add a post-aggregator
    pub fn post_aggregator(mut self, spec: PostAggregatorSpec) -> Self {
        self.query.post_aggregators.push(spec);
        self
    }

    /// Add a query interval
    pub fn interval(mut self, interval: Interval) -> Self {
        self.query.intervals.push(interval);
        self
    }

    /// Set the bucket granularity
    pub fn granularity(mut self, granularity: Granularity) -> Self {
        self.query.granularity = granularity;
        self
    }

    /// Set the dimension filter
    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.query.filter = Some(filter);
        self
    }

    /// Set a context entry
    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.context.insert(key.into(), value.into());
        self
    }

    /// Set the limit/sort spec
    pub fn limit_spec(mut self, spec: LimitSpec) -> Self {
        self.query.limit_spec = Some(spec);
        self
    }

    /// Finish building
    pub fn build(self) -> GroupByQuery {
        self.query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::row::{row, Value};

    fn sample_query() -> GroupByQuery {
        GroupByQuery::builder("events")
            .dimension(DimensionSpec::identity("host"))
            .aggregator(AggregatorSpec::count("rows"))
            .interval(Interval::new(0, 3_600_000))
            .granularity(Granularity::minute())
            .build()
    }

    #[test]
    fn test_context_override_copies() {
        let query = sample_query();
        let overridden = query.with_context_overrides([("groupByMerge", "false")]);
        assert!(query.context().is_empty());
        assert_eq!(
            overridden.context().get("groupByMerge").map(String::as_str),
            Some("false")
        );
    }

    #[test]
    fn test_context_bool_default() {
        let query = sample_query();
        assert!(query.context_bool("groupByMerge", true));
        let off = query.with_context_overrides([("groupByMerge", "false")]);
        assert!(!off.context_bool("groupByMerge", true));
    }

    #[test]
    fn test_interval_chunking() {
        let interval = Interval::new(0, 250);
        let chunks = interval.chunked(100);
        assert_eq!(
            chunks,
            vec![
                Interval::new(0, 100),
                Interval::new(100, 200),
                Interval::new(200, 250)
            ]
        );
    }

    #[test]
    fn test_interval_chunking_disabled() {
        let interval = Interval::new(0, 250);
        assert_eq!(interval.chunked(0), vec![interval]);
    }

    #[test]
    fn test_interval_minutes() {
        assert_eq!(Interval::new(0, 3_600_000).minutes(), 60);
    }

    #[test]
    fn test_limit_spec_plain_limit_streams() {
        let spec = LimitSpec::limit(2);
        let rows = vec![
            row(0, vec![("n", Value::Long(1))]),
            row(0, vec![("n", Value::Long(2))]),
            row(0, vec![("n", Value::Long(3))]),
        ];
        let out: Vec<Row> = spec.apply(Box::new(rows.into_iter())).collect();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_limit_spec_orders_then_truncates() {
        let spec = LimitSpec::ordered(vec![OrderByColumn::desc("n")], 2);
        let rows = vec![
            row(0, vec![("n", Value::Long(1))]),
            row(0, vec![("n", Value::Long(3))]),
            row(0, vec![("n", Value::Long(2))]),
        ];
        let out: Vec<Row> = spec.apply(Box::new(rows.into_iter())).collect();
        let values: Vec<i64> = out.iter().map(|r| r.get("n").unwrap().as_long().unwrap()).collect();
        assert_eq!(values, vec![3, 2]);
    }
}
