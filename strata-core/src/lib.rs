//! Strata Core
//!
//! This crate provides the core runtime for the Strata hierarchical
//! dataflow engine. It implements:
//!
//! - Hierarchical cell indices and typed, layered product stores
//! - A message/flush protocol with per-position completion tracking
//! - Seven node kinds: transform, predicate, observer, fold, unfold,
//!   provider, and output
//! - A single-router distribution layer with cross-layer replay
//! - A cooperatively driven source that can never outrun the graph
//!
//! # Architecture
//!
//! The crate is organized into a few layers:
//!
//! - `model`: indices, products, stores, flush counting, the layer census
//! - `graph`: messages, joins, gating, node kinds, routing, execution
//! - `config` / `registry` / `persist`: job assembly and output backends
//!
//! # Example
//!
//! ```rust,no_run
//! use strata_core::{GraphBuilder, NodeOptions, ProductMap};
//!
//! let graph = GraphBuilder::new()
//!     .source("Source", |sink| {
//!         let run = match sink.emit_child(sink.base(), 0, "run", ProductMap::new()) {
//!             Some(run) => run,
//!             None => return,
//!         };
//!         for event in 0..5 {
//!             let mut products = ProductMap::new();
//!             products.insert("hits", vec![event as u32; 3]);
//!             if sink.emit_child(&run, event, "event", products).is_none() {
//!                 return;
//!             }
//!         }
//!     })
//!     .source_product::<Vec<u32>>("hits")
//!     .transform(
//!         "tracker",
//!         ["hits"],
//!         |hits: &Vec<u32>| hits.len(),
//!         "track_count",
//!         NodeOptions::serial(),
//!     )
//!     .output::<usize>("write_tracks", "tracker/track_count")
//!     .build()
//!     .expect("valid graph");
//!
//! let summary = graph.run().expect("clean run");
//! assert_eq!(summary.cells("run/event"), 5);
//! ```

pub mod config;
mod error;
mod graph;
mod model;
pub mod persist;
pub mod registry;

pub use config::Configuration;
pub use error::{ConfigurationError, Error, RuntimeError};
pub use graph::{
    Concurrency, EndOfMessage, FoldFn, Graph, GraphBuilder, Message, NodeKind, NodeOptions,
    NodeStats, ObserverFn, OutputSpec, PredicateFn, PredicateResult, ProductQuery, ResolvedInputs,
    RunSummary, SourceSink, TransformFn, UnfoldInitFn,
};
pub use model::{
    more_derived, most_derived, CellIndex, FlushCounts, Handle, IndexHash, LayerHierarchy, Product,
    ProductMap, ProductStore, StoreKind, TypeTag,
};
