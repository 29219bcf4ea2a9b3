//! Query metric events
//!
//! Builds the per-query metric event the surrounding service emits: the
//! datasource, query shape, and interval span as plain values. Emission
//! plumbing (registries, transports) lives outside this crate.

use crate::query::GroupByQuery;

/// Shape and span of one group-by query, ready for emission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMetricEvent {
    /// Datasource the query ran against
    pub data_source: String,
    /// Query type tag
    pub query_type: &'static str,
    /// Number of grouping dimensions
    pub num_dimensions: usize,
    /// Number of aggregators
    pub num_aggregators: usize,
    /// Whether a filter was present
    pub has_filter: bool,
    /// Total queried span in whole minutes, across all intervals
    pub interval_minutes: i64,
    /// Human-readable interval list
    pub intervals: String,
}

impl QueryMetricEvent {
    /// Build the metric event for a group-by query
    pub fn from_query(query: &GroupByQuery) -> Self {
        let interval_minutes = query.intervals().iter().map(|i| i.minutes()).sum();
        let intervals = query
            .intervals()
            .iter()
            .map(|i| format!("{}/{}", i.start, i.end))
            .collect::<Vec<_>>()
            .join(",");
        Self {
            data_source: query.data_source().to_string(),
            query_type: "groupBy",
            num_dimensions: query.dimensions().len(),
            num_aggregators: query.aggregators().len(),
            has_filter: query.has_filter(),
            interval_minutes,
            intervals,
        }
    }
}
