//! Cross-Layer Repeater
//!
//! When a node joins inputs declared at different hierarchy layers, the
//! coarser-layer datum has to be replayed once per finer-layer request:
//! one run-scoped calibration feeds every event under that run. Two
//! streams meet here:
//!
//! - the *data* stream carries the coarser-layer store, exactly once per
//!   coarser index;
//! - the *request* stream announces "message id M at the finer layer needs
//!   a copy of the coarser data for index I".
//!
//! Arrival order is arbitrary. If a request arrives first it queues; if
//! data arrives first it is cached and replayed for every queued and
//! subsequent request. A flush token carrying the count of replays
//! promised retires the cache entry once every promised replay has been
//! served. Entries still pending at shutdown are a diagnosable condition
//! (warning), not a failure.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::model::{IndexHash, ProductStore};

#[derive(Debug, Default)]
struct RepeatEntry {
    data: Option<Arc<ProductStore>>,
    queued: Vec<u64>,
    served: usize,
    promised: Option<usize>,
}

impl RepeatEntry {
    fn retired(&self) -> bool {
        matches!(self.promised, Some(promised) if self.served >= promised && self.queued.is_empty())
    }
}

/// Replays one coarser-layer store per finer-layer request, keyed by the
/// coarser index hash.
#[derive(Debug, Default)]
pub struct Repeater {
    entries: Mutex<FxHashMap<IndexHash, RepeatEntry>>,
}

impl Repeater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver the coarser-layer store. Returns the message ids of all
    /// queued requests this datum releases.
    pub fn put_data(&self, index_hash: IndexHash, store: Arc<ProductStore>) -> Vec<u64> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(index_hash).or_default();
        entry.data = Some(store);
        let released = std::mem::take(&mut entry.queued);
        entry.served += released.len();
        if entry.retired() {
            entries.remove(&index_hash);
        }
        released
    }

    /// Register a finer-layer request. Returns the cached store if data is
    /// already present; otherwise the request queues until `put_data`.
    pub fn request(&self, msg_id: u64, index_hash: IndexHash) -> Option<Arc<ProductStore>> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(index_hash).or_default();
        match entry.data.clone() {
            Some(store) => {
                entry.served += 1;
                if entry.retired() {
                    entries.remove(&index_hash);
                }
                Some(store)
            }
            None => {
                entry.queued.push(msg_id);
                None
            }
        }
    }

    /// Flush token for a coarser index, declaring how many replays were
    /// promised in total. Evicts the entry once the promise is met.
    pub fn flush(&self, index_hash: IndexHash, promised: usize) {
        let mut entries = self.entries.lock();
        if promised == 0 {
            entries.remove(&index_hash);
            return;
        }
        let entry = entries.entry(index_hash).or_default();
        entry.promised = Some(promised);
        if entry.retired() {
            entries.remove(&index_hash);
        }
    }

    /// Entries still cached or still waiting. Non-zero at shutdown points
    /// at a wiring or flush-accounting bug.
    pub fn residual(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProductMap;

    fn run_store() -> Arc<ProductStore> {
        let base = ProductStore::base("Source");
        let mut products = ProductMap::new();
        products.insert("geometry", 1_u32);
        base.make_child(0, "run", "calib", products)
    }

    #[test]
    fn data_first_replays_for_every_request() {
        let repeater = Repeater::new();
        let store = run_store();
        let hash = store.index().hash();

        assert!(repeater.put_data(hash, Arc::clone(&store)).is_empty());
        for msg_id in [10, 11, 12] {
            let replayed = repeater.request(msg_id, hash).expect("cached datum");
            assert!(Arc::ptr_eq(&replayed, &store));
        }

        // Flush promising exactly the three served replays evicts.
        repeater.flush(hash, 3);
        assert_eq!(repeater.residual(), 0);
    }

    #[test]
    fn requests_queue_until_data_arrives() {
        let repeater = Repeater::new();
        let store = run_store();
        let hash = store.index().hash();

        assert!(repeater.request(7, hash).is_none());
        assert!(repeater.request(8, hash).is_none());

        let released = repeater.put_data(hash, Arc::clone(&store));
        assert_eq!(released, vec![7, 8]);

        repeater.flush(hash, 2);
        assert_eq!(repeater.residual(), 0);
    }

    #[test]
    fn flush_before_final_request_keeps_entry_until_served() {
        let repeater = Repeater::new();
        let store = run_store();
        let hash = store.index().hash();

        repeater.put_data(hash, Arc::clone(&store));
        assert!(repeater.request(1, hash).is_some());
        repeater.flush(hash, 2);
        // One replay still owed; the entry must survive.
        assert_eq!(repeater.residual(), 1);
        assert!(repeater.request(2, hash).is_some());
        assert_eq!(repeater.residual(), 0);
    }

    #[test]
    fn unfulfilled_entries_are_reported_not_dropped() {
        let repeater = Repeater::new();
        let store = run_store();
        repeater.request(3, store.index().hash());
        assert_eq!(repeater.residual(), 1);
    }

    #[test]
    fn zero_promise_flush_evicts_immediately() {
        let repeater = Repeater::new();
        let store = run_store();
        let hash = store.index().hash();
        repeater.put_data(hash, store);
        repeater.flush(hash, 0);
        assert_eq!(repeater.residual(), 0);
    }
}
