//! Layer Census
//!
//! A concurrent tally of every hierarchy layer seen during a run: how many
//! positions were visited at `/job/run`, `/job/run/event`, and so on. The
//! census is purely observational: it is rendered as a tree and logged at
//! end of run, and tests use it to assert traversal shape.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::model::index::{CellIndex, IndexHash};

#[derive(Debug)]
struct LayerEntry {
    name: String,
    path: String,
    parent_hash: Option<IndexHash>,
    count: AtomicU64,
}

/// Census of visited layers, keyed by layer hash.
#[derive(Debug, Default)]
pub struct LayerHierarchy {
    layers: DashMap<IndexHash, LayerEntry>,
}

impl LayerHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one visited position. Creates the layer entry on first sight;
    /// concurrent recorders may race to insert, the count is incremented on
    /// whichever entry wins.
    pub fn record(&self, index: &CellIndex) {
        if let Some(entry) = self.layers.get(&index.layer_hash()) {
            entry.count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let entry = self
            .layers
            .entry(index.layer_hash())
            .or_insert_with(|| LayerEntry {
                name: index.layer_name().to_string(),
                path: index.layer_path(),
                parent_hash: index.parent().map(|p| p.layer_hash()),
                count: AtomicU64::new(0),
            });
        entry.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of positions visited at the layer whose path ends with
    /// `layer` (a path suffix, e.g. `"event"` or `"run/event"`).
    ///
    /// Returns `None` when no layer matches; ambiguity across multiple
    /// matching layers is resolved by summing (the census is diagnostic,
    /// not authoritative).
    pub fn count_for(&self, layer: &str) -> Option<u64> {
        let suffix = if layer.starts_with('/') {
            layer.to_string()
        } else {
            format!("/{layer}")
        };
        let mut total = None;
        for entry in self.layers.iter() {
            if entry.path.ends_with(&suffix) {
                *total.get_or_insert(0) += entry.count.load(Ordering::Relaxed);
            }
        }
        total
    }

    /// Per-layer totals keyed by layer path, sorted by path.
    pub fn totals(&self) -> Vec<(String, u64)> {
        let mut totals: Vec<(String, u64)> = self
            .layers
            .iter()
            .map(|e| (e.path.clone(), e.count.load(Ordering::Relaxed)))
            .collect();
        totals.sort_by(|a, b| a.0.cmp(&b.0));
        totals
    }

    /// Render the census as an indented tree, children under parents.
    pub fn render(&self) -> String {
        let mut entries: Vec<(IndexHash, String, Option<IndexHash>, u64)> = self
            .layers
            .iter()
            .map(|e| {
                (
                    *e.key(),
                    e.name.clone(),
                    e.parent_hash,
                    e.count.load(Ordering::Relaxed),
                )
            })
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1));

        let mut out = String::from("seen layers:");
        let roots: Vec<_> = entries.iter().filter(|e| e.2.is_none()).cloned().collect();
        for root in roots {
            self.render_from(&entries, &root, 1, &mut out);
        }
        out
    }

    fn render_from(
        &self,
        entries: &[(IndexHash, String, Option<IndexHash>, u64)],
        node: &(IndexHash, String, Option<IndexHash>, u64),
        depth: usize,
        out: &mut String,
    ) {
        out.push('\n');
        out.push_str(&"  ".repeat(depth));
        out.push_str(&format!("{}: {}", node.1, node.3));
        for child in entries.iter().filter(|e| e.2 == Some(node.0)) {
            self.render_from(entries, child, depth + 1, out);
        }
    }

    /// Log the census at info level. Called once at end of run.
    pub fn log_summary(&self) {
        if !self.layers.is_empty() {
            tracing::info!("{}", self.render());
        }
    }
}
