//! Persistence backends for output nodes.
//!
//! An output node hands every matched product to a [`Persistence`]
//! implementation together with the cell index it belongs to. Backends
//! decide the on-disk shape; the engine only guarantees each (product,
//! position) pair is written once.

use std::fmt;

use parking_lot::Mutex;

use crate::model::{CellIndex, Product};

pub type PersistError = Box<dyn std::error::Error + Send + Sync>;

pub trait Persistence: Send + Sync + 'static {
    fn write(&self, name: &str, product: &Product, index: &CellIndex)
        -> Result<(), PersistError>;

    /// Look a previously written product back up. Backends without read
    /// support report absence.
    fn read(&self, _name: &str, _index: &CellIndex) -> Result<Option<Product>, PersistError> {
        Ok(None)
    }
}

/// Default backend: logs each write and keeps nothing.
#[derive(Debug, Default)]
pub struct TracingPersistence;

impl Persistence for TracingPersistence {
    fn write(&self, name: &str, product: &Product, index: &CellIndex)
        -> Result<(), PersistError> {
        tracing::info!(
            product = name,
            r#type = product.tag().name(),
            index = %index,
            "write"
        );
        Ok(())
    }
}

/// One write an output node performed, as recorded by
/// [`MemoryPersistence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub name: String,
    pub type_name: &'static str,
    pub index: String,
}

/// Collects writes in memory. Mostly useful in tests and demos.
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<Vec<WriteRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<WriteRecord> {
        self.records.lock().clone()
    }
}

impl fmt::Debug for MemoryPersistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPersistence")
            .field("writes", &self.records.lock().len())
            .finish()
    }
}

impl Persistence for MemoryPersistence {
    fn write(&self, name: &str, product: &Product, index: &CellIndex)
        -> Result<(), PersistError> {
        self.records.lock().push(WriteRecord {
            name: name.to_string(),
            type_name: product.tag().name(),
            index: index.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_records_writes() {
        let backend = MemoryPersistence::new();
        let index = CellIndex::base().make_child(3, "event");
        let product = Product::new(vec![1u32, 2, 3]);
        backend.write("hits", &product, &index).unwrap();

        let records = backend.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "hits");
        assert_eq!(records[0].index, "/job:0/event:3");
    }
}
