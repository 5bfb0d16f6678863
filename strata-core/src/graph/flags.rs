//! Exactly-Once Bookkeeping
//!
//! Nodes may see the same hierarchical position more than once:
//! re-deliveries through different store chains, repeated continuations,
//! or gated work released long after the position's flush went by.
//! [`OnceCache`] guarantees a single execution per position: the first
//! claim wins and is permanent, so no re-delivery in any order can run
//! the position twice. Entries live for the duration of the run.
//!
//! [`StoreCounter`] is the per-partition ledger a fold keeps: how many
//! fine-grained contributions arrived, how many the flush promised, and a
//! single-shot finalization claim.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::model::IndexHash;

/// Lifecycle flags for one hierarchical position at one node.
#[derive(Debug, Default)]
pub(crate) struct StoreFlag {
    processed: AtomicBool,
    /// Message id that first claimed the position. Kept for diagnostics.
    original_id: OnceLock<u64>,
}

impl StoreFlag {
    pub fn mark_processed(&self) {
        self.processed.store(true, Ordering::Release);
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Acquire)
    }

    pub fn original_id(&self) -> Option<u64> {
        self.original_id.get().copied()
    }
}

/// Claim table keyed by index hash. `try_claim` is the gate in front of a
/// node's user function.
#[derive(Debug, Default)]
pub(crate) struct OnceCache {
    entries: DashMap<IndexHash, Arc<StoreFlag>>,
}

impl OnceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// First caller for a position gets `Some(flag)` and must run the
    /// work; every later caller gets `None`.
    pub fn try_claim(&self, hash: IndexHash, msg_id: u64) -> Option<Arc<StoreFlag>> {
        let mut claimed = None;
        self.entries.entry(hash).or_insert_with(|| {
            let flag = Arc::new(StoreFlag::default());
            let _ = flag.original_id.set(msg_id);
            claimed = Some(Arc::clone(&flag));
            flag
        });
        claimed
    }

    /// Record that the claimed work finished.
    pub fn done(&self, flag: &StoreFlag) {
        flag.mark_processed();
    }

    /// Positions claimed but never finished. Reported at shutdown; nonzero
    /// values mean work was still in flight when the run ended.
    pub fn residual(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_processed()).count()
    }
}

/// Per-partition ledger for a fold node.
#[derive(Debug)]
pub(crate) struct StoreCounter {
    processed: AtomicUsize,
    expected: OnceLock<usize>,
    original_id: OnceLock<u64>,
    finalized: AtomicBool,
}

impl StoreCounter {
    pub fn new() -> Self {
        Self {
            processed: AtomicUsize::new(0),
            expected: OnceLock::new(),
            original_id: OnceLock::new(),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn increment(&self) {
        self.processed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Acquire)
    }

    /// Record the flush's promise. The first flush wins; the partition's
    /// flush arrives exactly once per source traversal.
    pub fn set_expected(&self, expected: usize, original_id: u64) {
        let _ = self.expected.set(expected);
        let _ = self.original_id.set(original_id);
    }

    pub fn expected(&self) -> Option<usize> {
        self.expected.get().copied()
    }

    pub fn original_id(&self) -> Option<u64> {
        self.original_id.get().copied()
    }

    pub fn is_complete(&self) -> bool {
        self.expected()
            .is_some_and(|expected| self.processed() >= expected)
    }

    /// Single-shot finalization claim. Only one caller ever gets `true`.
    pub fn claim_finalize(&self) -> bool {
        !self.finalized.swap(true, Ordering::AcqRel)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_claim_wins() {
        let cache = OnceCache::new();
        let flag = cache.try_claim(42, 7).expect("first claim succeeds");
        assert!(cache.try_claim(42, 8).is_none());
        assert_eq!(flag.original_id(), Some(7));
    }

    #[test]
    fn claims_are_permanent() {
        let cache = OnceCache::new();
        let flag = cache.try_claim(42, 7).unwrap();
        cache.done(&flag);
        // A finished position still refuses re-delivery.
        assert!(cache.try_claim(42, 9).is_none());
        assert_eq!(cache.residual(), 0);
    }

    #[test]
    fn unfinished_claims_count_as_residual() {
        let cache = OnceCache::new();
        let flag = cache.try_claim(1, 10).unwrap();
        let _ = cache.try_claim(2, 11).unwrap();
        cache.done(&flag);
        assert_eq!(cache.residual(), 1);
    }

    #[test]
    fn counter_completes_against_promise() {
        let counter = StoreCounter::new();
        counter.increment();
        assert!(!counter.is_complete());

        counter.set_expected(2, 31);
        assert!(!counter.is_complete());
        counter.increment();
        assert!(counter.is_complete());
        assert_eq!(counter.original_id(), Some(31));
        assert_eq!(counter.expected(), Some(2));
        assert_eq!(counter.processed(), 2);
    }

    #[test]
    fn finalization_is_single_shot() {
        let counter = StoreCounter::new();
        counter.set_expected(0, 5);
        assert!(counter.is_complete());
        assert!(counter.claim_finalize());
        assert!(!counter.claim_finalize());
        assert!(counter.is_finalized());
    }
}
