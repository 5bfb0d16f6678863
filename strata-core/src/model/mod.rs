//! Data Model
//!
//! The immutable value types everything else is built on:
//!
//! - [`CellIndex`]: a position in the data hierarchy.
//! - [`ProductStore`]: a bag of typed products scoped to one index, with a
//!   parent link for cross-layer lookups.
//! - [`Product`] / [`ProductMap`] / [`Handle`]: type-erased values with
//!   checked downcasts.
//! - [`FlushCounters`] / [`FlushCounts`]: the child-count bookkeeping that
//!   makes fold completion decidable.
//! - [`LayerHierarchy`]: a diagnostic census of visited layers.
//!
//! Everything here is either immutable after construction or mutated only
//! through insert-if-absent / atomic-increment patterns, which is what
//! makes unsynchronized `Arc` fan-out across worker tasks safe.

mod counter;
mod hierarchy;
mod index;
mod products;
mod store;

pub use counter::{FlushCounters, FlushCounts};
pub use hierarchy::LayerHierarchy;
pub use index::{CellIndex, IndexHash};
pub use products::{Handle, Product, ProductMap, TypeTag};
pub use store::{more_derived, most_derived, ProductStore, StoreKind};
