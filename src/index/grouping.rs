//! Bounded in-memory grouping index
//!
//! Keys merged rows by (bucket timestamp, dimension value tuple) and holds
//! one fixed-size buffer region per (key, aggregator) pair inside a single
//! append-only arena. An arena of offset-addressed regions keeps memory
//! bounded and allocation-free on the per-row path even across millions of
//! grouping keys; there are no per-key aggregation objects.
//!
//! The index is populated by repeated [`GroupingIndex::add`] calls and
//! consumed exactly once through [`GroupingIndex::into_rows`], which applies
//! post-aggregators while iterating. Exceeding the configured key cap is a
//! hard failure, never silent truncation.

use std::collections::BTreeMap;
use std::collections::HashMap;

use tracing::debug;

use crate::aggregation::post::PostAggregatorSpec;
use crate::aggregation::{AggregatorSpec, BufferAggregator};
use crate::error::{MergeError, Result};
use crate::query::granularity::Granularity;
use crate::query::row::{Row, Value};

/// Identity of one output row: truncated bucket timestamp plus the
/// dimension value tuple, in dimension order. `None` marks a dimension the
/// input row did not carry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GroupKey {
    /// Bucket start timestamp (epoch millis)
    pub bucket: i64,
    /// Dimension values, in the index's dimension order
    pub dimensions: Vec<Option<String>>,
}

/// Bounded, mutable grouping structure holding buffer-resident aggregation
/// state per key
pub struct GroupingIndex {
    bucket_start: i64,
    granularity: Granularity,
    dimension_names: Vec<String>,
    specs: Vec<AggregatorSpec>,
    aggregators: Vec<Box<dyn BufferAggregator>>,
    /// Per-aggregator offset within one cell
    offsets: Vec<usize>,
    cell_size: usize,
    key_cap: usize,
    /// One cell per key, appended in insertion order
    arena: Vec<u8>,
    /// Key to arena cell offset; BTreeMap keeps emission in ascending
    /// bucket-time order
    cells: BTreeMap<GroupKey, usize>,
}

impl GroupingIndex {
    /// Create an index for the given bucketing and aggregator specs.
    ///
    /// `bucket_start` floors every truncated timestamp, so buckets that
    /// precede the query start collapse into the first bucket.
    pub fn new(
        bucket_start: i64,
        granularity: Granularity,
        dimension_names: Vec<String>,
        specs: Vec<AggregatorSpec>,
        key_cap: usize,
    ) -> Self {
        let aggregators: Vec<Box<dyn BufferAggregator>> =
            specs.iter().map(AggregatorSpec::build).collect();
        let mut offsets = Vec::with_capacity(specs.len());
        let mut cell_size = 0;
        for spec in &specs {
            offsets.push(cell_size);
            cell_size += spec.storage_size();
        }
        Self {
            bucket_start,
            granularity,
            dimension_names,
            specs,
            aggregators,
            offsets,
            cell_size,
            key_cap,
            arena: Vec::new(),
            cells: BTreeMap::new(),
        }
    }

    /// Number of distinct grouping keys currently held
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no key has been added
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Fold one row into the index.
    ///
    /// Returns the distinct-key count after the add. Fails with
    /// [`MergeError::ResourceExhausted`] when a new key would push the index
    /// past its cap; the caller must treat that as fatal to the whole merge.
    pub fn add(&mut self, row: &Row) -> Result<usize> {
        let bucket = self
            .granularity
            .truncate(row.timestamp())
            .max(self.bucket_start);
        let dimensions: Vec<Option<String>> = self
            .dimension_names
            .iter()
            .map(|name| row.get(name).and_then(Value::as_dimension))
            .collect();
        let key = GroupKey { bucket, dimensions };

        let cell_offset = match self.cells.get(&key) {
            Some(&offset) => offset,
            None => {
                if self.cells.len() >= self.key_cap {
                    debug!(limit = self.key_cap, "grouping key cap exceeded");
                    return Err(MergeError::ResourceExhausted {
                        limit: self.key_cap,
                    });
                }
                let offset = self.arena.len();
                self.arena.resize(offset + self.cell_size, 0);
                for (aggregator, agg_offset) in self.aggregators.iter().zip(&self.offsets) {
                    aggregator.init(&mut self.arena, offset + agg_offset);
                }
                self.cells.insert(key, offset);
                offset
            }
        };

        for (aggregator, agg_offset) in self.aggregators.iter().zip(&self.offsets) {
            aggregator.aggregate(&mut self.arena, cell_offset + agg_offset, row)?;
        }
        Ok(self.cells.len())
    }

    /// Consume the index, yielding one row per key in ascending bucket-time
    /// order with post-aggregators applied.
    ///
    /// Aggregator state is decoded out of the arena cell by cell; decoded
    /// values own their memory, so the arena is released as soon as the
    /// iterator is dropped.
    pub fn into_rows(
        self,
        post_aggregators: Vec<PostAggregatorSpec>,
    ) -> impl Iterator<Item = Row> + Send {
        let GroupingIndex {
            dimension_names,
            specs,
            aggregators,
            offsets,
            arena,
            cells,
            ..
        } = self;

        cells.into_iter().map(move |(key, cell_offset)| {
            let mut event: HashMap<String, Value> =
                HashMap::with_capacity(dimension_names.len() + specs.len());
            for (name, value) in dimension_names.iter().zip(key.dimensions) {
                if let Some(value) = value {
                    event.insert(name.clone(), Value::Str(value));
                }
            }
            for ((spec, aggregator), agg_offset) in
                specs.iter().zip(&aggregators).zip(&offsets)
            {
                event.insert(
                    spec.name().to_string(),
                    aggregator.get(&arena, cell_offset + agg_offset),
                );
            }
            for post in &post_aggregators {
                let value = post.compute(&event);
                event.insert(post.name().to_string(), value);
            }
            Row::new(key.bucket, event)
        })
    }
}
