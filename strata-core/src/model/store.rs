//! Product Store
//!
//! A `ProductStore` is an immutable bag of products scoped to one
//! hierarchy position, with an optional link to the nearest enclosing
//! store. The parent link is what makes cross-layer visibility work: a
//! consumer scoped to an event can read a run-scoped product by walking
//! the chain.
//!
//! Stores are built once, by the component that publishes them, and never
//! mutated afterwards. Fan-out across worker tasks is therefore plain
//! `Arc` sharing with no copying and no locks.
//!
//! A distinguished *flush* store carries no products. It signals "no more
//! children will be produced at this layer under this parent" and carries
//! the [`FlushCounts`] snapshot that folds compare their progress against.

use std::fmt;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::model::counter::FlushCounts;
use crate::model::index::CellIndex;
use crate::model::products::{Handle, Product, ProductMap};

/// What a store represents: payload or end-of-layer signal.
#[derive(Debug, Clone)]
pub enum StoreKind {
    Data,
    Flush {
        counts: Arc<FlushCounts>,
        /// Message id of the triggering event this flush follows; lets
        /// downstream joins correlate a flush with the data before it.
        original_id: u64,
    },
}

/// Immutable, parent-linked bag of products at one hierarchy position.
pub struct ProductStore {
    index: Arc<CellIndex>,
    source: String,
    products: ProductMap,
    parent: Option<Arc<ProductStore>>,
    kind: StoreKind,
}

impl ProductStore {
    /// The root store of a run, at the base index.
    pub fn base(source: impl Into<String>) -> Arc<Self> {
        Self::base_with(source, ProductMap::new())
    }

    /// The root store, carrying initial job-scoped products.
    pub fn base_with(source: impl Into<String>, products: ProductMap) -> Arc<Self> {
        Arc::new(Self {
            index: CellIndex::base(),
            source: source.into(),
            products,
            parent: None,
            kind: StoreKind::Data,
        })
    }

    /// The position this store is scoped to.
    pub fn index(&self) -> &Arc<CellIndex> {
        &self.index
    }

    /// Name of the component that produced this store.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Layer name of the scoped position.
    pub fn layer_name(&self) -> &str {
        self.index.layer_name()
    }

    /// The nearest enclosing store, if any.
    pub fn parent(&self) -> Option<&Arc<ProductStore>> {
        self.parent.as_ref()
    }

    pub fn products(&self) -> &ProductMap {
        &self.products
    }

    /// Whether this is the end-of-layer sentinel rather than data.
    pub fn is_flush(&self) -> bool {
        matches!(self.kind, StoreKind::Flush { .. })
    }

    /// Child counts promised by a flush store. `None` on data stores.
    pub fn flush_counts(&self) -> Option<&Arc<FlushCounts>> {
        match &self.kind {
            StoreKind::Flush { counts, .. } => Some(counts),
            StoreKind::Data => None,
        }
    }

    /// Id of the message this flush follows. `None` on data stores.
    pub fn original_id(&self) -> Option<u64> {
        match &self.kind {
            StoreKind::Flush { original_id, .. } => Some(*original_id),
            StoreKind::Data => None,
        }
    }

    /// Whether this store itself (not an ancestor) holds `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.products.contains(name)
    }

    /// Raw product lookup in this store only.
    pub fn product(&self, name: &str) -> Option<&Product> {
        self.products.get(name)
    }

    /// Typed access to a product held by this store.
    ///
    /// Fails with `UnresolvedProduct` if absent and `TypeMismatch` if the
    /// stored value's runtime type disagrees with `T`.
    pub fn get<T: 'static>(&self, name: &str) -> Result<&T, RuntimeError> {
        let product = self
            .products
            .get(name)
            .ok_or_else(|| RuntimeError::UnresolvedProduct {
                name: name.to_string(),
                index: self.index.to_string(),
            })?;
        product
            .downcast_ref::<T>()
            .ok_or_else(|| RuntimeError::TypeMismatch {
                name: name.to_string(),
                index: self.index.to_string(),
                actual: product.tag().name(),
                requested: std::any::type_name::<T>(),
            })
    }

    /// Typed, owning view of a product held by this store.
    pub fn handle<T: Send + Sync + 'static>(&self, name: &str) -> Result<Handle<T>, RuntimeError> {
        let product = self
            .products
            .get(name)
            .ok_or_else(|| RuntimeError::UnresolvedProduct {
                name: name.to_string(),
                index: self.index.to_string(),
            })?;
        Handle::new(name, product, Arc::clone(&self.index))
    }

    /// The nearest store in the ancestor chain (including `self`) that
    /// holds `name`, or `None`.
    pub fn store_for_product<'a>(self: &'a Arc<Self>, name: &str) -> Option<&'a Arc<ProductStore>> {
        if self.products.contains(name) {
            return Some(self);
        }
        self.parent.as_ref().and_then(|p| p.store_for_product(name))
    }

    /// A new store at the *same* index carrying additional products: "more
    /// is now known about this position". The receiver becomes the parent,
    /// so earlier products stay resolvable through the chain.
    pub fn make_continuation(
        self: &Arc<Self>,
        source: impl Into<String>,
        products: ProductMap,
    ) -> Arc<ProductStore> {
        Arc::new(ProductStore {
            index: Arc::clone(&self.index),
            source: source.into(),
            products,
            parent: Some(Arc::clone(self)),
            kind: StoreKind::Data,
        })
    }

    /// A new store at a child position, one layer deeper.
    pub fn make_child(
        self: &Arc<Self>,
        number: u64,
        layer_name: &str,
        source: impl Into<String>,
        products: ProductMap,
    ) -> Arc<ProductStore> {
        Arc::new(ProductStore {
            index: self.index.make_child(number, layer_name),
            source: source.into(),
            products,
            parent: Some(Arc::clone(self)),
            kind: StoreKind::Data,
        })
    }

    /// The flush sentinel for this store's position. Carries no products.
    pub fn make_flush(
        self: &Arc<Self>,
        source: impl Into<String>,
        counts: FlushCounts,
        original_id: u64,
    ) -> Arc<ProductStore> {
        Arc::new(ProductStore {
            index: Arc::clone(&self.index),
            source: source.into(),
            products: ProductMap::new(),
            parent: Some(Arc::clone(self)),
            kind: StoreKind::Flush {
                counts: Arc::new(counts),
                original_id,
            },
        })
    }

    /// The store in the chain (including `self`) scoped to the given index
    /// hash, if any.
    pub fn ancestor_at<'a>(self: &'a Arc<Self>, index_hash: u64) -> Option<&'a Arc<ProductStore>> {
        if self.index.hash() == index_hash {
            return Some(self);
        }
        self.parent.as_ref().and_then(|p| p.ancestor_at(index_hash))
    }
}

impl fmt::Debug for ProductStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProductStore")
            .field("index", &self.index.to_string())
            .field("source", &self.source)
            .field("flush", &self.is_flush())
            .field("products", &self.products.names())
            .finish()
    }
}

/// Of two stores, the one scoped deeper in the hierarchy. Ties go to the
/// first argument.
pub fn more_derived<'a>(a: &'a Arc<ProductStore>, b: &'a Arc<ProductStore>) -> &'a Arc<ProductStore> {
    if b.index().depth() > a.index().depth() {
        b
    } else {
        a
    }
}

/// The deepest-scoped store of a set, or `None` if the set is empty. Ties
/// go to the earliest store.
pub fn most_derived(stores: &[Arc<ProductStore>]) -> Option<&Arc<ProductStore>> {
    stores.iter().reduce(|a, b| more_derived(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_store() -> Arc<ProductStore> {
        let base = ProductStore::base("Source");
        let mut run_products = ProductMap::new();
        run_products.insert("geometry", "cylinder".to_string());
        let run = base.make_child(0, "run", "Source", run_products);
        let mut event_products = ProductMap::new();
        event_products.insert("hits", vec![1_u32, 2, 3]);
        run.make_child(7, "event", "Source", event_products)
    }

    #[test]
    fn typed_access_and_failures() {
        let event = event_store();
        let hits = event.get::<Vec<u32>>("hits").expect("present and typed");
        assert_eq!(hits.len(), 3);
        assert!(matches!(
            event.get::<String>("hits"),
            Err(RuntimeError::TypeMismatch { .. })
        ));
        assert!(matches!(
            event.get::<u32>("tracks"),
            Err(RuntimeError::UnresolvedProduct { .. })
        ));
    }

    #[test]
    fn chain_resolution_walks_to_ancestors() {
        let event = event_store();
        // "hits" lives on the event store itself.
        let owner = event.store_for_product("hits").expect("resolvable");
        assert_eq!(owner.layer_name(), "event");
        // "geometry" is run-scoped and resolves through the parent link.
        let owner = event.store_for_product("geometry").expect("resolvable");
        assert_eq!(owner.layer_name(), "run");
        assert!(event.store_for_product("tracks").is_none());
    }

    #[test]
    fn continuation_keeps_the_index_and_the_chain() {
        let event = event_store();
        let mut extra = ProductMap::new();
        extra.insert("tracks", 2_usize);
        let cont = event.make_continuation("tracker", extra);

        assert_eq!(cont.index(), event.index());
        assert_eq!(cont.source(), "tracker");
        assert!(cont.contains("tracks"));
        // Products of the original store remain reachable through the chain.
        assert!(cont.store_for_product("hits").is_some());
        assert!(cont.store_for_product("geometry").is_some());
    }

    #[test]
    fn flush_stores_carry_counts_and_no_products() {
        let event = event_store();
        let run_store = event.parent().expect("has parent");
        let counts = FlushCounts::single("event", run_store.index().child_layer_hash("event"), 8);
        let flush = Arc::clone(run_store).make_flush("Source", counts, 41);

        assert!(flush.is_flush());
        assert!(flush.products().is_empty());
        assert_eq!(flush.original_id(), Some(41));
        assert_eq!(
            flush.flush_counts().and_then(|c| c.count_for_name("event")),
            Some(8)
        );
        assert_eq!(flush.index(), run_store.index());
    }

    #[test]
    fn more_derived_picks_the_deeper_store() {
        let event = event_store();
        let run = Arc::clone(event.parent().expect("has parent"));
        assert_eq!(more_derived(&run, &event).layer_name(), "event");
        assert_eq!(more_derived(&event, &run).layer_name(), "event");
    }

    #[test]
    fn most_derived_picks_the_deepest_of_a_set() {
        let event = event_store();
        let run = Arc::clone(event.parent().expect("has parent"));
        let stores = vec![Arc::clone(&run), Arc::clone(&event), run];
        assert_eq!(
            most_derived(&stores).map(|s| s.layer_name()),
            Some("event")
        );
        assert!(most_derived(&[]).is_none());
    }

    #[test]
    fn ancestor_at_finds_by_index_hash() {
        let event = event_store();
        let run_hash = event.index().parent().expect("parent").hash();
        let found = event.ancestor_at(run_hash).expect("present");
        assert_eq!(found.layer_name(), "run");
        assert!(event.ancestor_at(0xdead_beef).is_none());
    }
}
