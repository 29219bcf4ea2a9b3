//! Group-by result merging
//!
//! Folds partial per-partition results into one bounded grouping index and
//! emits the merged sequence. The engine rewrites every aggregator to its
//! combining variant first: merging partition results folds
//! already-aggregated state and never re-runs bottom-level hashing.
//!
//! Accumulation is sequential by default. When the result source exposes
//! partition runs and the config enables it, partitions execute concurrently
//! under a rayon pool, each producing a partition-local row buffer; a single
//! reducer then folds the buffers into the index serially, so concurrent
//! folds into the same grouping key cannot happen by construction.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::aggregation::AggregatorSpec;
use crate::config::MergeConfig;
use crate::error::{MergeError, Result};
use crate::index::grouping::GroupingIndex;
use crate::query::granularity::Granularity;
use crate::query::row::{Row, Value};
use crate::query::{GroupByQuery, Interval};

/// Context key suppressing the merge; the engine becomes a pass-through
pub const GROUP_BY_MERGE_KEY: &str = "groupByMerge";

/// A finite, single-pass sequence of rows
pub type RowIter = Box<dyn Iterator<Item = Row> + Send>;

// ============================================================================
// Result sources
// ============================================================================

/// Produces per-partition rows for a query.
///
/// `run` is the sequential pull entry point and must always work.
/// `partition_runs` is an optional capability: sources that can split the
/// query into independent partition sub-queries return one lazy sequence
/// per partition, enabling the parallel accumulation path.
pub trait ResultSource: Send + Sync {
    /// All rows for the query, across every partition
    fn run(&self, query: &GroupByQuery) -> RowIter;

    /// One row sequence per partition, when the source supports it
    fn partition_runs(&self, _query: &GroupByQuery) -> Option<Vec<RowIter>> {
        None
    }
}

/// Result source over in-memory partitions, mainly for tests and local
/// execution
#[derive(Debug, Clone, Default)]
pub struct VecResultSource {
    partitions: Vec<Vec<Row>>,
}

impl VecResultSource {
    /// Source with the given per-partition rows
    pub fn new(partitions: Vec<Vec<Row>>) -> Self {
        Self { partitions }
    }
}

impl ResultSource for VecResultSource {
    fn run(&self, _query: &GroupByQuery) -> RowIter {
        let rows: Vec<Row> = self.partitions.iter().flatten().cloned().collect();
        Box::new(rows.into_iter())
    }

    fn partition_runs(&self, _query: &GroupByQuery) -> Option<Vec<RowIter>> {
        Some(
            self.partitions
                .iter()
                .map(|partition| {
                    let rows = partition.clone();
                    Box::new(rows.into_iter()) as RowIter
                })
                .collect(),
        )
    }
}

/// Pre-merge decoration that splits query intervals into period-sized
/// chunks and concatenates the inner runs.
///
/// Chunked sub-queries run strictly sequentially, so a chunking source
/// never advertises partition runs.
pub struct IntervalChunkingSource {
    inner: Arc<dyn ResultSource>,
    period_ms: i64,
}

impl IntervalChunkingSource {
    /// Wrap `inner`, chunking intervals into `period_ms` slices
    pub fn new(inner: Arc<dyn ResultSource>, period_ms: i64) -> Self {
        Self { inner, period_ms }
    }
}

impl ResultSource for IntervalChunkingSource {
    fn run(&self, query: &GroupByQuery) -> RowIter {
        let chunks: Vec<Interval> = query
            .intervals()
            .iter()
            .flat_map(|interval| interval.chunked(self.period_ms))
            .collect();
        let inner = Arc::clone(&self.inner);
        let query = query.clone();
        Box::new(
            chunks
                .into_iter()
                .flat_map(move |chunk| inner.run(&query.with_intervals(vec![chunk]))),
        )
    }
}

// ============================================================================
// Merge engine
// ============================================================================

/// Orchestrates combining-aggregator selection, bounded accumulation,
/// granularity re-anchoring, and final limiting
pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    /// Engine with the given configuration
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Engine configuration
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Wrap a source with the engine's pre-merge decorations
    pub fn pre_merge_decoration(&self, source: Arc<dyn ResultSource>) -> Arc<dyn ResultSource> {
        if self.config.chunk_period_ms > 0 {
            Arc::new(IntervalChunkingSource::new(source, self.config.chunk_period_ms))
        } else {
            source
        }
    }

    /// Merge the source's partition results for a group-by query.
    ///
    /// Returns the merged sequence in ascending bucket-time order, with
    /// post-aggregators applied and the limit/sort spec honored last. When
    /// the query's context sets `groupByMerge=false` the inner result is
    /// returned unchanged.
    pub fn merge_results(
        &self,
        query: &GroupByQuery,
        source: &dyn ResultSource,
    ) -> Result<RowIter> {
        if !query.context_bool(GROUP_BY_MERGE_KEY, true) {
            debug!(data_source = query.data_source(), "merge suppressed by context");
            return Ok(source.run(query));
        }
        let inner = query.with_context_overrides([(GROUP_BY_MERGE_KEY, "false")]);
        self.merge_group_by_results(&inner, source)
    }

    fn merge_group_by_results(
        &self,
        query: &GroupByQuery,
        source: &dyn ResultSource,
    ) -> Result<RowIter> {
        let first_interval = query.intervals().first().ok_or_else(|| {
            MergeError::InvalidQuery("group-by query has no intervals".to_string())
        })?;
        let time_start = first_interval.start;
        let granularity = query.granularity().clone();

        // Anchor through bucket iteration rather than truncation, so the
        // all-encompassing granularity starts at the real interval start
        // instead of its sentinel minimum.
        let bucket_start = granularity
            .bucket_starts(time_start, time_start + 1)
            .next()
            .unwrap_or(time_start);

        let combining: Vec<AggregatorSpec> = query
            .aggregators()
            .iter()
            .map(AggregatorSpec::combining)
            .collect();
        let dimension_names: Vec<String> = query
            .dimensions()
            .iter()
            .map(|spec| spec.output_name.clone())
            .collect();

        let mut index = GroupingIndex::new(
            bucket_start,
            granularity.clone(),
            dimension_names.clone(),
            combining,
            self.config.max_intermediate_rows,
        );

        let accumulated = self
            .config
            .parallel_merge
            .then(|| source.partition_runs(query))
            .flatten()
            .map(|partitions| {
                self.accumulate_parallel(&mut index, &dimension_names, partitions)
            });
        match accumulated {
            Some(result) => result?,
            None => {
                for row in source.run(query) {
                    self.accumulate(&mut index, &dimension_names, row)?;
                }
            }
        }

        Ok(self.emit(query, index, granularity))
    }

    /// Fold one partition row into the index.
    ///
    /// Dimension-value lookups are normalized case-insensitively here and
    /// only here; the per-partition path stays case-sensitive.
    fn accumulate(
        &self,
        index: &mut GroupingIndex,
        dimension_names: &[String],
        row: Row,
    ) -> Result<()> {
        let row = normalize_dimension_keys(row, dimension_names);
        index.add(&row)?;
        Ok(())
    }

    /// Drain partitions concurrently into partition-local buffers, then
    /// reduce serially.
    fn accumulate_parallel(
        &self,
        index: &mut GroupingIndex,
        dimension_names: &[String],
        partitions: Vec<RowIter>,
    ) -> Result<()> {
        debug!(partitions = partitions.len(), "parallel accumulation");
        let buffers: Vec<Vec<Row>> = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.merge_workers)
            .build()
        {
            Ok(pool) => pool.install(|| {
                partitions
                    .into_par_iter()
                    .map(|partition| partition.collect())
                    .collect()
            }),
            Err(e) => {
                warn!("merge pool unavailable, draining partitions sequentially: {e}");
                partitions
                    .into_iter()
                    .map(|partition| partition.collect())
                    .collect()
            }
        };
        for buffer in buffers {
            for row in buffer {
                self.accumulate(index, dimension_names, row)?;
            }
        }
        Ok(())
    }

    /// Emit the merged sequence: post-aggregated index rows with bucket
    /// timestamps converted back through the granularity, limited last.
    fn emit(&self, query: &GroupByQuery, index: GroupingIndex, granularity: Granularity) -> RowIter {
        let post_aggregators = query.post_aggregators().to_vec();
        let rows = index.into_rows(post_aggregators).map(move |row| {
            let (bucket, event) = row.into_parts();
            // Convert through the granularity to preserve calendar
            // semantics for bucket timestamps.
            Row::new(granularity.to_datetime(bucket).timestamp_millis(), event)
        });
        let sequence: RowIter = Box::new(rows);
        match query.limit_spec() {
            Some(spec) => spec.apply(sequence),
            None => sequence,
        }
    }
}

/// Re-key event entries matching the grouping dimensions case-insensitively
/// to the canonical output names. Applied only at the merge-input boundary.
fn normalize_dimension_keys(row: Row, dimension_names: &[String]) -> Row {
    let (timestamp, mut event) = row.into_parts();
    for name in dimension_names {
        if event.contains_key(name) {
            continue;
        }
        let matched = event
            .keys()
            .find(|key| key.eq_ignore_ascii_case(name))
            .cloned();
        if let Some(actual) = matched {
            if let Some(value) = event.remove(&actual) {
                event.insert(name.clone(), value);
            }
        }
    }
    Row::new(timestamp, event)
}

// ============================================================================
// Post-merge value manipulation
// ============================================================================

/// Hook invoked once per aggregator per output row with the aggregator spec
/// and its raw value; returns a possibly-transformed value
pub type MetricManipulationFn = Arc<dyn Fn(&AggregatorSpec, &Value) -> Value + Send + Sync>;

/// Build a per-row transform applying `manipulation` to every aggregator
/// output of `query`
pub fn row_manipulator(
    query: &GroupByQuery,
    manipulation: MetricManipulationFn,
) -> impl Fn(Row) -> Row {
    let specs: Vec<AggregatorSpec> = query.aggregators().to_vec();
    move |row| {
        let (timestamp, mut event) = row.into_parts();
        for spec in &specs {
            if let Some(value) = event.get(spec.name()) {
                let manipulated = manipulation(spec, value);
                event.insert(spec.name().to_string(), manipulated);
            }
        }
        Row::new(timestamp, event)
    }
}

/// Manipulation finalizing distinct-count sketches to their estimates for
/// transport; every other value passes through unchanged
pub fn finalize_sketches() -> MetricManipulationFn {
    Arc::new(|_spec, value| match value {
        Value::Sketch(sketch) => Value::Double(sketch.estimate()),
        other => other.clone(),
    })
}
