//! Hierarchical Cell Index
//!
//! A `CellIndex` identifies one position inside the data hierarchy
//! (e.g. job → run → subrun → event). Indices form an immutable tree:
//! every index holds a shared reference to its parent, and new positions
//! are created only through [`CellIndex::make_child`].
//!
//! # Hashing
//!
//! Two hashes are precomputed at construction and used everywhere else in
//! the engine:
//!
//! - `hash`: combines the parent hash, the layer name, and the sibling
//!   number. Two indices with equal hashes are structurally identical
//!   (same ancestors, same numbers). All per-position caches are keyed
//!   by this value.
//!
//! - `layer_hash`: combines only the chain of layer names, ignoring
//!   numbers. It identifies "the run layer" independent of which run,
//!   and keys the flush-count bookkeeping.
//!
//! Hash quality matters because comparisons are done using only the hash;
//! we use `FxHasher`, which is deterministic across runs.
//!
//! # Thread Safety
//!
//! Indices are immutable after construction and shared via `Arc`. No owner
//! ever mutates one, so fan-out across worker tasks needs no locking.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxHasher;

/// Hash value identifying one hierarchy position.
pub type IndexHash = u64;

fn combine_hash(parent: Option<u64>, layer_name: &str, number: Option<u64>) -> u64 {
    let mut hasher = FxHasher::default();
    parent.unwrap_or(0).hash(&mut hasher);
    layer_name.hash(&mut hasher);
    if let Some(number) = number {
        number.hash(&mut hasher);
    }
    hasher.finish()
}

/// Immutable identifier of one position in the data hierarchy.
#[derive(Debug)]
pub struct CellIndex {
    number: u64,
    layer_name: String,
    parent: Option<Arc<CellIndex>>,
    hash: IndexHash,
    layer_hash: IndexHash,
}

impl CellIndex {
    /// Layer name of the root of every hierarchy.
    pub const BASE_LAYER: &'static str = "job";

    /// The root index: layer `"job"`, number 0, no parent.
    pub fn base() -> Arc<Self> {
        Arc::new(Self {
            number: 0,
            layer_name: Self::BASE_LAYER.to_string(),
            parent: None,
            hash: combine_hash(None, Self::BASE_LAYER, Some(0)),
            layer_hash: combine_hash(None, Self::BASE_LAYER, None),
        })
    }

    /// Create the child of `self` with the given sibling number at a new
    /// (or existing) layer. Never fails; always allocates a new index.
    pub fn make_child(self: &Arc<Self>, number: u64, layer_name: impl Into<String>) -> Arc<Self> {
        let layer_name = layer_name.into();
        Arc::new(Self {
            number,
            hash: combine_hash(Some(self.hash), &layer_name, Some(number)),
            layer_hash: combine_hash(Some(self.layer_hash), &layer_name, None),
            parent: Some(Arc::clone(self)),
            layer_name,
        })
    }

    /// Position among siblings.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Name of the layer this index lives at (e.g. `"run"`).
    pub fn layer_name(&self) -> &str {
        &self.layer_name
    }

    /// The immediately enclosing index, if any.
    pub fn parent(&self) -> Option<&Arc<CellIndex>> {
        self.parent.as_ref()
    }

    /// Walk the ancestor chain until an index at `layer_name` is found.
    ///
    /// Strictly ancestors: `self` is never returned even if it sits at the
    /// requested layer.
    pub fn parent_at(&self, layer_name: &str) -> Option<&Arc<CellIndex>> {
        let mut current = self.parent.as_ref();
        while let Some(index) = current {
            if index.layer_name == layer_name {
                return Some(index);
            }
            current = index.parent.as_ref();
        }
        None
    }

    /// Structural hash (ancestors + numbers).
    pub fn hash(&self) -> IndexHash {
        self.hash
    }

    /// Hash of the layer-name chain only.
    pub fn layer_hash(&self) -> IndexHash {
        self.layer_hash
    }

    /// The layer hash a child of `self` at `layer_name` would carry.
    ///
    /// Lets flush bookkeeping refer to a child layer before any child index
    /// has been created.
    pub fn child_layer_hash(&self, layer_name: &str) -> IndexHash {
        combine_hash(Some(self.layer_hash), layer_name, None)
    }

    /// Number of ancestors. The base index has depth 0.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent.as_ref();
        while let Some(index) = current {
            depth += 1;
            current = index.parent.as_ref();
        }
        depth
    }

    /// Slash-delimited chain of layer names, e.g. `/job/run/event`.
    pub fn layer_path(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{}/{}", parent.layer_path(), self.layer_name),
            None => format!("/{}", self.layer_name),
        }
    }

    fn path(&self) -> Vec<(&str, u64)> {
        let mut segments = match &self.parent {
            Some(parent) => parent.path(),
            None => Vec::new(),
        };
        segments.push((&self.layer_name, self.number));
        segments
    }
}

impl PartialEq for CellIndex {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for CellIndex {}

impl Hash for CellIndex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl PartialOrd for CellIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Lexicographic over the ancestor chain, then the sibling number. Used for
// deterministic iteration and debugging only, never for correctness.
impl Ord for CellIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path().cmp(&other.path())
    }
}

impl fmt::Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (layer, number) in self.path() {
            write!(f, "/{layer}:{number}")?;
        }
        Ok(())
    }
}
