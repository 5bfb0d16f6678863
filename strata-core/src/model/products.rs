//! Type-Erased Products
//!
//! A product is a named, typed value scoped to a hierarchy position. The
//! engine never knows product types at compile time, so values are stored
//! behind `Arc<dyn Any>` with the concrete type name recorded for
//! diagnostics and a [`TypeTag`] used for build-time producer/consumer
//! matching.
//!
//! Downcasts are always checked: a wrong-type access yields a
//! [`RuntimeError::TypeMismatch`] naming both types, never a pointer
//! reinterpretation.

use std::any::{Any, TypeId};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::RuntimeError;
use crate::model::index::CellIndex;

/// Runtime type identity of a product: `TypeId` for matching plus the type
/// name for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    /// The tag for a concrete type.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The recorded type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A single type-erased product value.
#[derive(Clone)]
pub struct Product {
    value: Arc<dyn Any + Send + Sync>,
    tag: TypeTag,
}

impl Product {
    /// Box a value as a product.
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            tag: TypeTag::of::<T>(),
        }
    }

    /// The runtime type of the stored value.
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Checked downcast to a reference.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Checked downcast to a shared owner.
    pub fn downcast_arc<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }
}

impl fmt::Debug for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Product").field("type", &self.tag.name).finish()
    }
}

/// Map from product name to type-erased value.
///
/// Built once by the producing component and immutable after the owning
/// store is published.
#[derive(Default, Clone, Debug)]
pub struct ProductMap {
    entries: FxHashMap<String, Product>,
}

impl ProductMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a typed value under `name`. Later inserts under the same name
    /// replace earlier ones; stores are built before publication so this is
    /// a construction-time concern only.
    pub fn insert<T: Send + Sync + 'static>(&mut self, name: impl Into<String>, value: T) {
        self.entries.insert(name.into(), Product::new(value));
    }

    /// Add an already-erased product under `name`.
    pub fn insert_product(&mut self, name: impl Into<String>, product: Product) {
        self.entries.insert(name.into(), product);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Product> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Product)> {
        self.entries.iter().map(|(name, product)| (name.as_str(), product))
    }

    /// Product names, sorted for deterministic diagnostics.
    pub fn names(&self) -> SmallVec<[&str; 4]> {
        let mut names: SmallVec<[&str; 4]> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Typed view of a product together with the index it is scoped to.
///
/// The downcast happens once at construction; dereferencing is free.
#[derive(Clone)]
pub struct Handle<T> {
    value: Arc<T>,
    index: Arc<CellIndex>,
}

impl<T: Send + Sync + 'static> Handle<T> {
    pub(crate) fn new(
        name: &str,
        product: &Product,
        index: Arc<CellIndex>,
    ) -> Result<Self, RuntimeError> {
        let value = product
            .downcast_arc::<T>()
            .ok_or_else(|| RuntimeError::TypeMismatch {
                name: name.to_string(),
                index: index.to_string(),
                actual: product.tag().name(),
                requested: std::any::type_name::<T>(),
            })?;
        Ok(Self { value, index })
    }

    /// The hierarchy position this product is scoped to.
    pub fn index(&self) -> &Arc<CellIndex> {
        &self.index
    }
}

impl<T> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("value", &self.value)
            .field("index", &self.index.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_round_trips_through_erasure() {
        let product = Product::new(42_i32);
        assert_eq!(product.downcast_ref::<i32>(), Some(&42));
        assert!(product.downcast_ref::<u32>().is_none());
        assert_eq!(product.tag(), TypeTag::of::<i32>());
    }

    #[test]
    fn map_insert_and_lookup() {
        let mut map = ProductMap::new();
        map.insert("hits", vec![1_u32, 2, 3]);
        map.insert("label", "three hits".to_string());

        assert!(map.contains("hits"));
        assert!(!map.contains("tracks"));
        assert_eq!(map.len(), 2);
        assert_eq!(map.names().as_slice(), ["hits", "label"]);

        let hits = map.get("hits").and_then(|p| p.downcast_ref::<Vec<u32>>());
        assert_eq!(hits, Some(&vec![1, 2, 3]));
    }

    #[test]
    fn handle_checks_the_type_once() {
        let index = CellIndex::base();
        let product = Product::new(2.5_f64);

        let handle = Handle::<f64>::new("energy", &product, Arc::clone(&index))
            .expect("types agree");
        assert_eq!(*handle, 2.5);
        assert_eq!(handle.index().layer_name(), "job");

        let err = Handle::<i64>::new("energy", &product, index).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));
    }
}
