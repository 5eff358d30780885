//! Property-based tests using proptest.
//!
//! Tests the key invariants of the engine:
//! - Row UIDs are unique, even when rows are created from many threads
//! - Group keys are deterministic and tell different key values apart
//! - The three aggregation strategies agree on sorted input

use proptest::prelude::*;
use rowflow::{
    collect_rows, group_key, record, ContinuousAggregation, ContinuousGroupBy, Count, EngineConfig,
    ExecutionContext, GroupBy, OrderedAggregation, Row, RowSource, Sequence, Sum, UnorderedAggregation,
    Value,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

// ── Helpers ────────────────────────────────────────────────────────────────

fn ctx() -> Arc<ExecutionContext> {
    ExecutionContext::new(EngineConfig::default())
}

/// Strategy: a key part that is either null or text drawn from the
/// characters the key encoding treats specially.
fn arb_key_part() -> impl Strategy<Value = Option<String>> {
    prop::option::of(prop::collection::vec(
        prop::sample::select(vec!['a', 'b', '-', '\\', '\0', '0']),
        0..4,
    ))
    .prop_map(|chars| chars.map(|c| c.into_iter().collect()))
}

fn key_row(ctx: &Arc<ExecutionContext>, parts: &[Option<String>]) -> Row {
    let stage = ctx.register_stage("Keys");
    let values = parts.iter().enumerate().map(|(i, part)| {
        let value = match part {
            Some(text) => Value::from(text.as_str()),
            None => Value::Null,
        };
        (format!("c{}", i), value)
    });
    ctx.create_row_with(&stage, values)
}

fn columns(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("c{}", i)).collect()
}

fn sorted_source(ctx: &Arc<ExecutionContext>, data: &[(u8, i32)]) -> RowSource {
    let mut data = data.to_vec();
    data.sort_by_key(|(k, _)| *k);
    let records: Vec<_> = data
        .into_iter()
        .map(|(k, v)| record([("k", Value::from(format!("k{}", k))), ("v", Value::Int(v))]))
        .collect();
    RowSource::new(ctx, "Sorted", records)
}

fn summarize(rows: &[Row]) -> Vec<(String, Value, Value)> {
    let mut out: Vec<_> = rows
        .iter()
        .map(|r| (r.get("k").to_string(), r.get("v").clone(), r.get("n").clone()))
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn run(ctx: &Arc<ExecutionContext>, mut stage: impl Sequence) -> Vec<(String, Value, Value)> {
    let rows = collect_rows(ctx, &mut stage).expect("aggregation should succeed");
    summarize(&rows)
}

// ── UID uniqueness ─────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_uids_unique_across_threads(threads in 1usize..6, per_thread in 1usize..200) {
        let ctx = ctx();
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || {
                    let stage = ctx.register_stage(&format!("Worker{}", t));
                    (0..per_thread).map(|_| ctx.create_row(&stage).uid()).collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for uid in handle.join().expect("worker thread panicked") {
                prop_assert!(seen.insert(uid), "duplicate uid {}", uid);
            }
        }
        prop_assert_eq!(seen.len(), threads * per_thread);
    }
}

// ── Group keys ─────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_group_key_deterministic(parts in prop::collection::vec(arb_key_part(), 1..4)) {
        let ctx = ctx();
        let cols = columns(parts.len());
        let first = group_key(&key_row(&ctx, &parts), &cols);
        let second = group_key(&key_row(&ctx, &parts), &cols);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_group_key_distinguishes_values(
        a in prop::collection::vec(arb_key_part(), 2),
        b in prop::collection::vec(arb_key_part(), 2),
    ) {
        let ctx = ctx();
        let cols = columns(2);
        let key_a = group_key(&key_row(&ctx, &a), &cols);
        let key_b = group_key(&key_row(&ctx, &b), &cols);
        prop_assert_eq!(key_a == key_b, a == b);
    }
}

// ── Aggregation equivalence ────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_strategies_agree_on_sorted_input(
        data in prop::collection::vec((0u8..5, -1000i32..1000), 0..60),
    ) {
        let unordered = {
            let ctx = ctx();
            let transform = GroupBy::new(&["k"]).with(Sum::new("v")).with(Count::rows("n"));
            let stage = UnorderedAggregation::new(&ctx, sorted_source(&ctx, &data), &["k"], transform);
            run(&ctx, stage)
        };
        let ordered = {
            let ctx = ctx();
            let transform = GroupBy::new(&["k"]).with(Sum::new("v")).with(Count::rows("n"));
            let stage = OrderedAggregation::new(&ctx, sorted_source(&ctx, &data), &["k"], transform);
            run(&ctx, stage)
        };
        let continuous = {
            let ctx = ctx();
            let operation = ContinuousGroupBy::new(&["k"]).with(Sum::new("v")).with(Count::rows("n"));
            let stage = ContinuousAggregation::new(&ctx, sorted_source(&ctx, &data), &["k"], operation);
            run(&ctx, stage)
        };

        let distinct: HashSet<u8> = data.iter().map(|(k, _)| *k).collect();
        prop_assert_eq!(unordered.len(), distinct.len());
        prop_assert_eq!(&unordered, &ordered);
        prop_assert_eq!(&unordered, &continuous);
    }
}
