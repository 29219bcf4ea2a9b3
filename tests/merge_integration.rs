//! End-to-end merge engine tests
//!
//! Exercises the full path: partition runners producing partially-aggregated
//! rows, the merge engine folding them with combining aggregators, and the
//! emitted sequence with post-aggregation, granularity conversion, and
//! limiting.

use std::collections::HashMap;

use meridian::aggregation::post::{ArithmeticOp, PostAggregatorSpec};
use meridian::aggregation::AggregatorSpec;
use meridian::index::grouping::GroupingIndex;
use meridian::merge::{
    finalize_sketches, row_manipulator, VecResultSource, GROUP_BY_MERGE_KEY,
};
use meridian::query::granularity::Granularity;
use meridian::query::row::{Row, Value};
use meridian::query::{DimensionSpec, LimitSpec, OrderByColumn};
use meridian::{GroupByQuery, Interval, MergeConfig, MergeEngine, MergeError};

// ============================================================================
// Fixtures
// ============================================================================

/// Raw fact rows: (timestamp, host, region, value)
fn raw_rows() -> Vec<(i64, &'static str, &'static str, i64)> {
    vec![
        (5_000, "web-1", "us-east", 10),
        (15_000, "web-1", "us-east", 20),
        (25_000, "web-2", "us-east", 5),
        (65_000, "web-1", "us-west", 7),
        (70_000, "web-2", "us-east", 3),
        (75_000, "web-2", "us-west", 9),
        (95_000, "web-1", "us-east", 1),
    ]
}

fn all_aggregators() -> Vec<AggregatorSpec> {
    vec![
        AggregatorSpec::count("rows"),
        AggregatorSpec::long_sum("total", "value"),
        AggregatorSpec::double_sum("total_d", "value"),
        AggregatorSpec::double_min("lo", "value"),
        AggregatorSpec::double_max("hi", "value"),
        AggregatorSpec::cardinality("uniq_regions", vec!["region".to_string()], false),
        AggregatorSpec::cardinality("uniq_pairs", vec!["host".to_string(), "region".to_string()], true),
    ]
}

fn query_for(granularity: Granularity) -> GroupByQuery {
    let mut builder = GroupByQuery::builder("events")
        .dimension(DimensionSpec::identity("host"))
        .interval(Interval::new(0, 3_600_000))
        .granularity(granularity);
    for agg in all_aggregators() {
        builder = builder.aggregator(agg);
    }
    builder.build()
}

fn input_row(ts: i64, host: &str, region: &str, value: i64) -> Row {
    let mut event = HashMap::new();
    event.insert("host".to_string(), Value::from(host));
    event.insert("region".to_string(), Value::from(region));
    event.insert("value".to_string(), Value::Long(value));
    Row::new(ts, event)
}

/// Run bottom-level aggregation over a partition of raw rows, the way a
/// partition runner would before shipping results to the merger.
fn aggregate_partition(
    query: &GroupByQuery,
    granularity: Granularity,
    rows: &[(i64, &str, &str, i64)],
) -> Vec<Row> {
    let bucket_start = granularity.bucket_starts(0, 1).next().unwrap();
    let mut index = GroupingIndex::new(
        bucket_start,
        granularity,
        query
            .dimensions()
            .iter()
            .map(|d| d.output_name.clone())
            .collect(),
        query.aggregators().to_vec(),
        1_000,
    );
    for &(ts, host, region, value) in rows {
        index.add(&input_row(ts, host, region, value)).unwrap();
    }
    index.into_rows(Vec::new()).collect()
}

/// Group and aggregate the full multiset in one pass: the reference result.
fn aggregate_direct(query: &GroupByQuery, granularity: Granularity) -> Vec<Row> {
    aggregate_partition(query, granularity, &raw_rows())
}

/// Split raw rows into partitions, aggregate each, and merge through the
/// engine.
fn merge_partitions(
    query: &GroupByQuery,
    granularity: Granularity,
    partition_count: usize,
    config: MergeConfig,
) -> Vec<Row> {
    let mut partitions: Vec<Vec<(i64, &str, &str, i64)>> = vec![Vec::new(); partition_count];
    for (i, row) in raw_rows().into_iter().enumerate() {
        partitions[i % partition_count].push(row);
    }
    let partials: Vec<Vec<Row>> = partitions
        .iter()
        .map(|p| aggregate_partition(query, granularity.clone(), p))
        .collect();

    let engine = MergeEngine::new(config);
    let source = VecResultSource::new(partials);
    engine.merge_results(query, &source).unwrap().collect()
}

fn by_key(rows: Vec<Row>) -> HashMap<(i64, String), Row> {
    rows.into_iter()
        .map(|r| {
            let host = r
                .get("host")
                .and_then(Value::as_dimension)
                .unwrap_or_default();
            ((r.timestamp(), host), r)
        })
        .collect()
}

// ============================================================================
// Combine-equals-direct
// ============================================================================

#[test]
fn combining_partitions_equals_direct_aggregation() {
    for granularity in [Granularity::All, Granularity::minute()] {
        for partition_count in [1, 2, 3] {
            let query = query_for(granularity.clone());
            let direct = by_key(aggregate_direct(&query, granularity.clone()));
            let merged = by_key(merge_partitions(
                &query,
                granularity.clone(),
                partition_count,
                MergeConfig::default(),
            ));

            assert_eq!(direct.len(), merged.len());
            for (key, direct_row) in &direct {
                let merged_row = merged
                    .get(key)
                    .unwrap_or_else(|| panic!("missing group {key:?}"));
                for name in ["rows", "total", "total_d", "lo", "hi", "uniq_regions", "uniq_pairs"]
                {
                    assert_eq!(
                        merged_row.get(name),
                        direct_row.get(name),
                        "aggregator {name} diverged for {key:?} with {partition_count} partitions"
                    );
                }
            }
        }
    }
}

#[test]
fn parallel_merge_equals_sequential_merge() {
    let granularity = Granularity::minute();
    let query = query_for(granularity.clone());
    let sequential = by_key(merge_partitions(
        &query,
        granularity.clone(),
        3,
        MergeConfig::default(),
    ));
    let parallel = by_key(merge_partitions(
        &query,
        granularity,
        3,
        MergeConfig::default().with_parallel_merge(true).with_merge_workers(3),
    ));
    assert_eq!(sequential, parallel);
}

// ============================================================================
// Cap enforcement
// ============================================================================

#[test]
fn cap_of_k_admits_k_groups_and_rejects_k_plus_one() {
    let granularity = Granularity::All;
    let query = query_for(granularity.clone());
    // The data has 2 distinct hosts under All granularity.
    let partials = vec![aggregate_partition(&query, granularity.clone(), &raw_rows())];

    let at_cap = MergeEngine::new(MergeConfig::default().with_max_intermediate_rows(2));
    let source = VecResultSource::new(partials.clone());
    assert!(at_cap.merge_results(&query, &source).is_ok());

    let below = MergeEngine::new(MergeConfig::default().with_max_intermediate_rows(1));
    let err = match below.merge_results(&query, &source) {
        Ok(_) => panic!("expected error"),
        Err(e) => e,
    };
    match err {
        MergeError::ResourceExhausted { limit } => assert_eq!(limit, 1),
        other => panic!("expected ResourceExhausted, got {other}"),
    }
}

// ============================================================================
// Granularity anchoring
// ============================================================================

#[test]
fn all_granularity_buckets_at_interval_start() {
    let start = 1_700_000_000_000;
    let query = GroupByQuery::builder("events")
        .dimension(DimensionSpec::identity("host"))
        .aggregator(AggregatorSpec::count("rows"))
        .interval(Interval::new(start, start + 3_600_000))
        .granularity(Granularity::All)
        .build();

    let partial = aggregate_partition(
        &query,
        Granularity::All,
        &[(start + 120_000, "web-1", "us-east", 1)],
    );

    let engine = MergeEngine::new(MergeConfig::default());
    let rows: Vec<Row> = engine
        .merge_results(&query, &VecResultSource::new(vec![partial]))
        .unwrap()
        .collect();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].timestamp(), start);
}

#[test]
fn minute_granularity_buckets_align_to_minutes() {
    let granularity = Granularity::minute();
    let query = query_for(granularity.clone());
    let merged = merge_partitions(&query, granularity, 2, MergeConfig::default());

    let timestamps: Vec<i64> = merged.iter().map(Row::timestamp).collect();
    assert!(timestamps.iter().all(|t| t % 60_000 == 0));
    // Ascending bucket-time order.
    let mut sorted = timestamps.clone();
    sorted.sort_unstable();
    assert_eq!(timestamps, sorted);
}

// ============================================================================
// Pass-through and limiting
// ============================================================================

#[test]
fn merge_suppression_returns_inner_result_unchanged() {
    let granularity = Granularity::All;
    let query = query_for(granularity.clone());
    let partials = vec![
        aggregate_partition(&query, granularity.clone(), &raw_rows()[..3]),
        aggregate_partition(&query, granularity, &raw_rows()[3..]),
    ];
    let inner_rows: usize = partials.iter().map(Vec::len).sum();

    let suppressed = query.with_context_overrides([(GROUP_BY_MERGE_KEY, "false")]);
    let engine = MergeEngine::new(MergeConfig::default());
    let rows: Vec<Row> = engine
        .merge_results(&suppressed, &VecResultSource::new(partials))
        .unwrap()
        .collect();
    assert_eq!(rows.len(), inner_rows);
}

#[test]
fn limit_spec_ranks_after_post_aggregation() {
    let granularity = Granularity::All;
    let mut builder = GroupByQuery::builder("events")
        .dimension(DimensionSpec::identity("host"))
        .interval(Interval::new(0, 3_600_000))
        .granularity(granularity.clone())
        .post_aggregator(PostAggregatorSpec::arithmetic(
            "avg",
            ArithmeticOp::Div,
            vec![
                PostAggregatorSpec::field_access("total_d"),
                PostAggregatorSpec::field_access("rows"),
            ],
        ))
        .limit_spec(LimitSpec::ordered(vec![OrderByColumn::desc("total")], 1));
    for agg in all_aggregators() {
        builder = builder.aggregator(agg);
    }
    let query = builder.build();

    let partials = vec![aggregate_partition(&query, granularity, &raw_rows())];
    let engine = MergeEngine::new(MergeConfig::default());
    let rows: Vec<Row> = engine
        .merge_results(&query, &VecResultSource::new(partials))
        .unwrap()
        .collect();

    // web-1 has the larger total (38 vs 17) and survives the limit.
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("host"), Some(&Value::Str("web-1".into())));
    assert_eq!(rows[0].get("total"), Some(&Value::Long(38)));
    // Post-aggregated average came along: 38 / 4 rows.
    assert_eq!(rows[0].get("avg"), Some(&Value::Double(9.5)));
}

// ============================================================================
// Finalization
// ============================================================================

#[test]
fn sketches_finalize_to_estimates_for_transport() {
    let granularity = Granularity::All;
    let query = query_for(granularity.clone());
    let merged = merge_partitions(&query, granularity, 2, MergeConfig::default());

    let manipulate = row_manipulator(&query, finalize_sketches());
    for row in merged.into_iter().map(manipulate) {
        let Some(Value::Double(regions)) = row.get("uniq_regions").cloned() else {
            panic!("uniq_regions not finalized");
        };
        assert!(regions >= 1.0 && regions <= 2.5, "regions {regions}");
    }
}
