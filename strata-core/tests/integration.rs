//! Integration Tests for the Dataflow Engine
//!
//! These tests drive complete graphs end to end: a source traversing a
//! small hierarchy, nodes of every kind, and the run summary the engine
//! reports at quiescence.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use strata_core::persist::{MemoryPersistence, Persistence};
use strata_core::{
    CellIndex, Error, Graph, GraphBuilder, NodeOptions, ProductMap, ProductQuery, RuntimeError,
    SourceSink,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// The build error a misconfigured graph is expected to produce.
fn build_error(result: Result<Graph, Error>) -> Error {
    match result {
        Ok(_) => panic!("build unexpectedly succeeded"),
        Err(err) => err,
    }
}

/// A source traversing one run of five events, each carrying a hit list.
fn five_event_source(sink: SourceSink) {
    let run = match sink.emit_child(sink.base(), 0, "run", ProductMap::new()) {
        Some(run) => run,
        None => return,
    };
    for event in 1..=5u64 {
        let mut products = ProductMap::new();
        products.insert("hits", vec![event as u32; event as usize]);
        if sink.emit_child(&run, event, "event", products).is_none() {
            return;
        }
    }
}

/// An observer sees every event exactly once, and the census records the
/// traversal shape.
#[test]
fn observer_sees_every_event_once() {
    init_tracing();
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = Arc::clone(&seen);

    let summary = GraphBuilder::new()
        .source("Source", five_event_source)
        .source_product::<Vec<u32>>("hits")
        .observe(
            "watch",
            ["hits"],
            move |_hits: &Vec<u32>| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            },
            NodeOptions::serial(),
        )
        .build()
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 5);
    assert_eq!(summary.cells("run"), 1);
    assert_eq!(summary.cells("run/event"), 5);
    assert_eq!(summary.stats["watch"].invoked, 5);
    assert_eq!(summary.stats["watch"].residual, 0);
}

/// A provider conjures an event-scoped product from the index, and a
/// downstream observer joins it with source data.
#[test]
fn provider_products_join_source_data() {
    init_tracing();
    let total = Arc::new(AtomicU32::new(0));
    let total_clone = Arc::clone(&total);

    let summary = GraphBuilder::new()
        .source("Source", five_event_source)
        .source_product::<Vec<u32>>("hits")
        .provide("ids", "event", |index: &CellIndex| index.number() * 10, "id")
        .observe(
            "check",
            ["hits", "id"],
            move |hits: &Vec<u32>, id: &u64| {
                assert_eq!(*id as usize, hits.len() * 10);
                total_clone.fetch_add(1, Ordering::SeqCst);
            },
            NodeOptions::serial(),
        )
        .build()
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(total.load(Ordering::SeqCst), 5);
    assert_eq!(summary.stats["ids"].invoked, 5);
}

/// Transforms chain through continuations, and an output node writes each
/// result once against the original event index.
#[test]
fn transform_chain_reaches_the_output() {
    init_tracing();
    let backend = Arc::new(MemoryPersistence::new());

    let summary = GraphBuilder::new()
        .source("Source", five_event_source)
        .source_product::<Vec<u32>>("hits")
        .transform(
            "counter",
            ["hits"],
            |hits: &Vec<u32>| hits.len(),
            "track_count",
            NodeOptions::unlimited(),
        )
        .transform(
            "doubler",
            ["track_count"],
            |count: &usize| count * 2,
            "doubled",
            NodeOptions::serial(),
        )
        .output_to::<usize>(
            "write",
            "doubler/doubled",
            Arc::clone(&backend) as Arc<dyn Persistence>,
            NodeOptions::serial(),
        )
        .build()
        .unwrap()
        .run()
        .unwrap();

    let records = backend.records();
    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|r| r.name == "doubled"));
    assert!(records.iter().all(|r| r.index.starts_with("/job:0/run:0/event:")));
    assert_eq!(summary.stats["counter"].invoked, 5);
    assert_eq!(summary.stats["doubler"].invoked, 5);
    assert_eq!(summary.stats["write"].invoked, 5);
}

/// A fold over event contributions publishes one result per run, once the
/// run's flush promises the contribution count.
#[test]
fn fold_collapses_events_into_a_run_total() {
    init_tracing();
    let observed = Arc::new(AtomicU32::new(0));
    let observed_clone = Arc::clone(&observed);

    let summary = GraphBuilder::new()
        .source("Source", five_event_source)
        .source_product::<Vec<u32>>("hits")
        .fold(
            "sum_hits",
            [ProductQuery::new("hits").at_layer("event")],
            0u32,
            |acc: &mut u32, hits: &Vec<u32>| *acc += hits.len() as u32,
            "run",
            "total_hits",
            NodeOptions::serial(),
        )
        .observe(
            "check_total",
            ["total_hits"],
            move |total: &u32| {
                observed_clone.store(*total, Ordering::SeqCst);
            },
            NodeOptions::serial(),
        )
        .build()
        .unwrap()
        .run()
        .unwrap();

    // 1 + 2 + 3 + 4 + 5 hits across the five events.
    assert_eq!(observed.load(Ordering::SeqCst), 15);
    assert_eq!(summary.stats["sum_hits"].invoked, 5);
    assert_eq!(summary.stats["sum_hits"].published, 1);
    assert_eq!(summary.stats["sum_hits"].residual, 0);
}

/// An unfold expands each event into samples, and a fold over the samples
/// closes against the unfold's own flush.
#[test]
fn unfold_and_fold_round_trip() {
    init_tracing();
    let totals = Arc::new(AtomicU32::new(0));
    let totals_clone = Arc::clone(&totals);
    let finalized = Arc::new(AtomicUsize::new(0));
    let finalized_clone = Arc::clone(&finalized);

    let summary = GraphBuilder::new()
        .source("Source", five_event_source)
        .source_product::<Vec<u32>>("hits")
        .unfold(
            "split",
            ["hits"],
            |hits: &Vec<u32>| hits.clone(),
            |remaining: &Vec<u32>| !remaining.is_empty(),
            |remaining: &mut Vec<u32>| {
                let mut products = ProductMap::new();
                products.insert("adc", remaining.remove(0));
                products
            },
            "sample",
            ["adc"],
            NodeOptions::serial(),
        )
        .fold(
            "sum_adc",
            ["adc"],
            0u32,
            |acc: &mut u32, adc: &u32| *acc += adc,
            "event",
            "event_total",
            NodeOptions::serial(),
        )
        .observe(
            "check",
            ["event_total"],
            move |total: &u32| {
                totals_clone.fetch_add(*total, Ordering::SeqCst);
                finalized_clone.fetch_add(1, Ordering::SeqCst);
            },
            NodeOptions::serial(),
        )
        .build()
        .unwrap()
        .run()
        .unwrap();

    // Event n carries n samples of value n: sum over n of n*n = 55.
    assert_eq!(totals.load(Ordering::SeqCst), 55);
    assert_eq!(finalized.load(Ordering::SeqCst), 5);
    assert_eq!(summary.cells("event/sample"), 15);
    assert_eq!(summary.stats["split"].invoked, 5);
    // Fifteen samples plus one trailing flush per event.
    assert_eq!(summary.stats["split"].published, 20);
    assert_eq!(summary.stats["sum_adc"].published, 5);
}

/// A predicate gates an observer: rejected events never run the body,
/// and everything still retires cleanly.
#[test]
fn predicate_gating_filters_events() {
    init_tracing();
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_clone = Arc::clone(&accepted);

    let summary = GraphBuilder::new()
        .source("Source", five_event_source)
        .source_product::<Vec<u32>>("hits")
        .predicate(
            "big_event",
            ["hits"],
            |hits: &Vec<u32>| hits.len() >= 3,
            NodeOptions::serial(),
        )
        .observe(
            "watch_big",
            ["hits"],
            move |hits: &Vec<u32>| {
                assert!(hits.len() >= 3);
                accepted_clone.fetch_add(1, Ordering::SeqCst);
            },
            NodeOptions::serial().when("big_event"),
        )
        .build()
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(accepted.load(Ordering::SeqCst), 3);
    assert_eq!(summary.stats["big_event"].invoked, 5);
    assert_eq!(summary.stats["watch_big"].invoked, 3);
    assert_eq!(summary.stats["watch_big"].residual, 0);
}

/// A run-scoped calibration feeds an event-scoped join through the
/// repeater, even though the calibration arrives after the first events.
#[test]
fn coarse_products_replay_for_fine_triggers() {
    init_tracing();
    let joined = Arc::new(AtomicUsize::new(0));
    let joined_clone = Arc::clone(&joined);

    let summary = GraphBuilder::new()
        .source("Source", |sink: SourceSink| {
            let mut run_products = ProductMap::new();
            run_products.insert("raw_geometry", 2.5f64);
            let run = match sink.emit_child(sink.base(), 7, "run", run_products) {
                Some(run) => run,
                None => return,
            };
            for event in 0..4u64 {
                let mut products = ProductMap::new();
                products.insert("hits", vec![1u32; 4]);
                if sink.emit_child(&run, event, "event", products).is_none() {
                    return;
                }
            }
        })
        .source_product::<f64>("raw_geometry")
        .source_product::<Vec<u32>>("hits")
        .transform(
            "calibrate",
            [ProductQuery::new("raw_geometry").at_layer("run")],
            |raw: &f64| raw * 2.0,
            "geometry",
            NodeOptions::serial(),
        )
        .observe(
            "fit",
            [
                ProductQuery::new("hits"),
                ProductQuery::new("geometry").at_layer("run"),
            ],
            move |hits: &Vec<u32>, geometry: &f64| {
                assert_eq!(*geometry, 5.0);
                assert_eq!(hits.len(), 4);
                joined_clone.fetch_add(1, Ordering::SeqCst);
            },
            NodeOptions::serial(),
        )
        .build()
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(joined.load(Ordering::SeqCst), 4);
    assert_eq!(summary.stats["calibrate"].invoked, 1);
    assert_eq!(summary.stats["fit"].invoked, 4);
}

/// A panicking node body aborts the run with an algorithm error naming
/// the node.
#[test]
fn panicking_algorithm_aborts_the_run() {
    init_tracing();
    let result = GraphBuilder::new()
        .source("Source", five_event_source)
        .source_product::<Vec<u32>>("hits")
        .transform(
            "fragile",
            ["hits"],
            |hits: &Vec<u32>| {
                if hits.len() == 3 {
                    panic!("cannot handle three hits");
                }
                hits.len()
            },
            "count",
            NodeOptions::serial(),
        )
        .build()
        .unwrap()
        .run();

    match result {
        Err(Error::Runtime(RuntimeError::Algorithm { node, message, .. })) => {
            assert_eq!(node, "fragile");
            assert!(message.contains("three hits"));
        }
        other => panic!("expected an algorithm error, got {other:?}"),
    }
}

/// Wiring mistakes fail the build, not the run.
#[test]
fn build_rejects_bad_wiring() {
    // Unknown product.
    let err = build_error(
        GraphBuilder::new()
            .source("Source", |_sink| {})
            .observe("watch", ["ghost"], |_: &u32| {}, NodeOptions::serial())
            .build(),
    );
    assert!(err.to_string().contains("no producer"));

    // Duplicate node name.
    let err = build_error(
        GraphBuilder::new()
            .source("Source", |_sink| {})
            .source_product::<u32>("value")
            .observe("watch", ["value"], |_: &u32| {}, NodeOptions::serial())
            .observe("watch", ["value"], |_: &u32| {}, NodeOptions::serial())
            .build(),
    );
    assert!(err.to_string().contains("already registered"));

    // Gating on a nonexistent predicate.
    let err = build_error(
        GraphBuilder::new()
            .source("Source", |_sink| {})
            .source_product::<u32>("value")
            .observe(
                "watch",
                ["value"],
                |_: &u32| {},
                NodeOptions::serial().when("ghost"),
            )
            .build(),
    );
    assert!(err.to_string().contains("unknown predicate"));

    // A missing source is caught even with no nodes.
    let err = build_error(GraphBuilder::new().build());
    assert!(err.to_string().contains("no driving source"));
}

/// Declared source product types are checked against consumers at build
/// time.
#[test]
fn build_rejects_type_conflicts() {
    let err = build_error(
        GraphBuilder::new()
            .source("Source", |_sink| {})
            .source_product::<Vec<u32>>("hits")
            .observe("watch", ["hits"], |_: &String| {}, NodeOptions::serial())
            .build(),
    );
    assert!(err.to_string().contains("expects"));
}
