//! Flush Accounting
//!
//! Folds need to know "how many children did this partition actually
//! have?", but the component that knows (the source or an unfold, which
//! enumerated the children) is far away from the fold that consumes them.
//! This module decouples the two:
//!
//! - A [`CellCounter`] is created per visited index, as a child of its
//!   parent's counter. When a position retires, its per-layer child counts
//!   are folded into the parent counter, so the count of every nested layer
//!   bubbles up the tree.
//!
//! - When a position is flushed, [`FlushCounters::extract`] removes its
//!   counter and produces a [`FlushCounts`] snapshot, which rides on the
//!   flush store so downstream folds can compare "children processed"
//!   against "children promised".
//!
//! The counters are owned by the router's layer-sentry stack (and by
//! unfolds for the layers they fabricate), which retires positions deepest
//! first, the same order a recursive traversal would destroy them in.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::model::index::{CellIndex, IndexHash};

/// Snapshot of child counts per layer, keyed by layer hash, carried on a
/// flush store.
#[derive(Debug, Default, Clone)]
pub struct FlushCounts {
    counts: FxHashMap<IndexHash, usize>,
    names: FxHashMap<String, IndexHash>,
}

impl FlushCounts {
    pub(crate) fn new(
        counts: FxHashMap<IndexHash, usize>,
        names: FxHashMap<String, IndexHash>,
    ) -> Self {
        Self { counts, names }
    }

    /// A snapshot promising exactly `count` children at one layer. Used by
    /// unfolds, which fabricate a single new layer.
    pub fn single(layer_name: &str, layer_hash: IndexHash, count: usize) -> Self {
        let mut counts = FxHashMap::default();
        counts.insert(layer_hash, count);
        let mut names = FxHashMap::default();
        names.insert(layer_name.to_string(), layer_hash);
        Self { counts, names }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Promised child count for a layer, by layer hash.
    pub fn count_for(&self, layer_hash: IndexHash) -> Option<usize> {
        self.counts.get(&layer_hash).copied()
    }

    /// Promised child count for a layer, by name.
    ///
    /// Layer names are assumed unique within one subtree; if a name repeats
    /// at different depths the first recorded hash wins.
    pub fn count_for_name(&self, layer_name: &str) -> Option<usize> {
        self.names
            .get(layer_name)
            .and_then(|hash| self.counts.get(hash))
            .copied()
    }
}

/// Per-index tally of direct and nested children, one per visited position.
#[derive(Debug)]
struct CellCounter {
    layer_hash: IndexHash,
    layer_name: String,
    parent: Option<IndexHash>,
    child_counts: FxHashMap<IndexHash, usize>,
    child_names: FxHashMap<String, IndexHash>,
}

/// Registry of live counters, keyed by index hash.
///
/// Single-owner (the router task or an unfold invocation), so it needs no
/// interior synchronization.
#[derive(Debug, Default)]
pub struct FlushCounters {
    counters: FxHashMap<IndexHash, CellCounter>,
}

impl FlushCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a visited index. Its parent's counter must already exist
    /// (positions are visited top-down).
    pub fn update(&mut self, index: &Arc<CellIndex>) {
        let parent = index.parent().map(|p| p.hash());
        self.counters.insert(
            index.hash(),
            CellCounter {
                layer_hash: index.layer_hash(),
                layer_name: index.layer_name().to_string(),
                parent,
                child_counts: FxHashMap::default(),
                child_names: FxHashMap::default(),
            },
        );
    }

    /// Retire an index: remove its counter, fold its tallies into the
    /// parent, and return the snapshot for the flush store.
    ///
    /// Must be called children-before-parents, which the router's sentry
    /// stack guarantees.
    pub fn extract(&mut self, index: &Arc<CellIndex>) -> FlushCounts {
        let Some(counter) = self.counters.remove(&index.hash()) else {
            return FlushCounts::default();
        };

        if let Some(parent_hash) = counter.parent {
            if let Some(parent) = self.counters.get_mut(&parent_hash) {
                *parent.child_counts.entry(counter.layer_hash).or_insert(0) += 1;
                parent
                    .child_names
                    .entry(counter.layer_name.clone())
                    .or_insert(counter.layer_hash);
                for (layer_hash, count) in &counter.child_counts {
                    *parent.child_counts.entry(*layer_hash).or_insert(0) += count;
                }
                for (name, hash) in &counter.child_names {
                    parent.child_names.entry(name.clone()).or_insert(*hash);
                }
            }
        }

        FlushCounts::new(counter.child_counts, counter.child_names)
    }

    /// Number of live counters; non-zero after a full drain indicates an
    /// accounting bug.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_bubble_up_through_extraction() {
        let base = CellIndex::base();
        let run = base.make_child(0, "run");
        let e0 = run.make_child(0, "event");
        let e1 = run.make_child(1, "event");

        let mut counters = FlushCounters::new();
        counters.update(&base);
        counters.update(&run);
        counters.update(&e0);
        assert!(counters.extract(&e0).is_empty());
        counters.update(&e1);
        assert!(counters.extract(&e1).is_empty());

        let run_counts = counters.extract(&run);
        assert_eq!(run_counts.count_for(e0.layer_hash()), Some(2));
        assert_eq!(run_counts.count_for_name("event"), Some(2));

        // The base saw one run and, transitively, two events.
        let base_counts = counters.extract(&base);
        assert_eq!(base_counts.count_for(run.layer_hash()), Some(1));
        assert_eq!(base_counts.count_for(e0.layer_hash()), Some(2));
        assert!(counters.is_empty());
    }

    #[test]
    fn extracting_an_unknown_index_yields_empty_counts() {
        let mut counters = FlushCounters::new();
        let index = CellIndex::base();
        assert!(counters.extract(&index).is_empty());
    }

    #[test]
    fn single_snapshot_promises_one_layer() {
        let run = CellIndex::base().make_child(0, "run");
        let hash = run.child_layer_hash("fragment");
        let counts = FlushCounts::single("fragment", hash, 4);
        assert_eq!(counts.count_for(hash), Some(4));
        assert_eq!(counts.count_for_name("fragment"), Some(4));
        assert_eq!(counts.count_for_name("event"), None);
    }
}
