//! Messages and End-of-Message Markers
//!
//! A [`Message`] is the envelope that moves a store through the graph,
//! together with the bookkeeping ids the join and flush machinery needs:
//!
//! - `id` is drawn from a single global, strictly increasing counter at
//!   true publish points: source yields, unfold children, flush emissions
//!   and fold finalizations. Continuation stores produced by transforms
//!   and providers *reuse* the triggering message's id, which is what lets
//!   downstream joins tag-match inputs that descend from the same trigger.
//!
//! - `original_id` is populated only on flush messages and names the id of
//!   the triggering event the flush follows.
//!
//! The [`EndOfMessage`] marker mirrors the index tree (one node per
//! visited position) and travels alongside the store so aggregation
//! outputs can be attributed to the right position.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::model::{CellIndex, ProductStore};

static MESSAGE_IDS: AtomicU64 = AtomicU64::new(0);

/// Draw the next message id from the global counter.
pub fn next_message_id() -> u64 {
    MESSAGE_IDS.fetch_add(1, Ordering::Relaxed)
}

/// Marker tree mirroring the index tree, one node per visited position.
#[derive(Debug)]
pub struct EndOfMessage {
    index: Arc<CellIndex>,
    parent: Option<Arc<EndOfMessage>>,
}

impl EndOfMessage {
    /// Root marker for the given position.
    pub fn base(index: Arc<CellIndex>) -> Arc<Self> {
        Arc::new(Self {
            index,
            parent: None,
        })
    }

    /// Marker for a child position, linked to `self`.
    pub fn make_child(self: &Arc<Self>, index: Arc<CellIndex>) -> Arc<Self> {
        Arc::new(Self {
            index,
            parent: Some(Arc::clone(self)),
        })
    }

    pub fn index(&self) -> &Arc<CellIndex> {
        &self.index
    }

    pub fn parent(&self) -> Option<&Arc<EndOfMessage>> {
        self.parent.as_ref()
    }

    /// Walk up to the marker at the given depth, if this chain reaches it.
    pub fn at_depth(self: &Arc<Self>, depth: usize) -> Option<&Arc<EndOfMessage>> {
        let mut current = self;
        loop {
            match current.index.depth().checked_sub(depth) {
                Some(0) => return Some(current),
                Some(_) => current = current.parent.as_ref()?,
                None => return None,
            }
        }
    }
}

/// Envelope carrying a store plus join/flush bookkeeping.
#[derive(Debug, Clone)]
pub struct Message {
    pub store: Arc<ProductStore>,
    pub eom: Option<Arc<EndOfMessage>>,
    pub id: u64,
    pub original_id: Option<u64>,
}

impl Message {
    /// A data message reusing the triggering message's id (continuations).
    pub fn continuation(store: Arc<ProductStore>, trigger: &Message) -> Self {
        Self {
            store,
            eom: trigger.eom.clone(),
            id: trigger.id,
            original_id: None,
        }
    }

    pub fn is_flush(&self) -> bool {
        self.store.is_flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_strictly_increase() {
        let a = next_message_id();
        let b = next_message_id();
        assert!(b > a);
    }

    #[test]
    fn eom_chain_mirrors_the_index_tree() {
        let base_index = CellIndex::base();
        let run = base_index.make_child(0, "run");
        let event = run.make_child(3, "event");

        let base = EndOfMessage::base(Arc::clone(&base_index));
        let run_eom = base.make_child(Arc::clone(&run));
        let event_eom = run_eom.make_child(Arc::clone(&event));

        assert_eq!(event_eom.index().layer_name(), "event");
        assert_eq!(
            event_eom.at_depth(1).map(|e| e.index().layer_name()),
            Some("run")
        );
        assert_eq!(
            event_eom.at_depth(0).map(|e| e.index().layer_name()),
            Some("job")
        );
        assert!(event_eom.at_depth(5).is_none());
    }
}
