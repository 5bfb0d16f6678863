//! Fold nodes: many fine-grained cells collapse into one result at a
//! coarser partition layer.
//!
//! Each contribution is deduplicated by its cell's index hash and folded
//! into the partition's accumulator. The partition is complete once its
//! flush has promised a contribution count and that many cells have been
//! folded; finalization claims the partition exactly once, publishes the
//! accumulated result as a continuation of the partition's store, and
//! carries the flush's end-of-message token so downstream folds can chain.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::graph::binding::{FoldOps, ResolvedInputs};
use crate::graph::engine::WorkGuard;
use crate::graph::flags::StoreCounter;
use crate::graph::message::{next_message_id, EndOfMessage, Message};
use crate::graph::nodes::{run_user, Node, NodeCtx, NodeInput, NodeStats, Published};
use crate::graph::ports::InputGroup;
use crate::model::{IndexHash, ProductStore};

struct Partition {
    /// `None` once the partition has been finalized and published.
    accumulator: Mutex<Option<Box<dyn Any + Send>>>,
    /// The partition-layer store finalization continues from.
    store: OnceLock<Arc<ProductStore>>,
    eom: OnceLock<Option<Arc<EndOfMessage>>>,
    counter: StoreCounter,
    /// Index hashes already folded in, for re-delivery dedup.
    seen: Mutex<FxHashSet<IndexHash>>,
}

impl Partition {
    fn new(initial: Box<dyn Any + Send>) -> Self {
        Self {
            accumulator: Mutex::new(Some(initial)),
            store: OnceLock::new(),
            eom: OnceLock::new(),
            counter: StoreCounter::new(),
            seen: Mutex::new(FxHashSet::default()),
        }
    }
}

pub(crate) struct FoldNode {
    name: Arc<str>,
    group: InputGroup,
    partitions: DashMap<IndexHash, Arc<Partition>>,
    ops: FoldOps,
    input_names: Vec<String>,
    /// Layer the published result lives at.
    partition_layer: String,
    /// Layer contributions arrive at; the flush's promised count for this
    /// layer is the completion target.
    expected_layer: String,
    /// Only flushes from this component close partitions. Flushes from
    /// other components at the same layer are hierarchy noise.
    flush_source: String,
    invoked: AtomicU64,
    published: AtomicU64,
}

impl FoldNode {
    pub fn new(
        name: Arc<str>,
        group: InputGroup,
        ops: FoldOps,
        input_names: Vec<String>,
        partition_layer: String,
        expected_layer: String,
        flush_source: String,
    ) -> Self {
        Self {
            name,
            group,
            partitions: DashMap::new(),
            ops,
            input_names,
            partition_layer,
            expected_layer,
            flush_source,
            invoked: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    fn partition(&self, hash: IndexHash) -> Arc<Partition> {
        Arc::clone(
            &self
                .partitions
                .entry(hash)
                .or_insert_with(|| Arc::new(Partition::new((self.ops.init)()))),
        )
    }

    fn on_data(&self, msg: &Message, ctx: &NodeCtx, guard: &WorkGuard) {
        for ready in self.group.offer(msg) {
            let trigger = &ready.trigger;
            if trigger.store.layer_name() != self.expected_layer {
                continue;
            }
            let chash = trigger.store.index().hash();
            let Some(pindex) = trigger.store.index().parent_at(&self.partition_layer) else {
                continue;
            };
            let phash = pindex.hash();
            let partition = self.partition(phash);
            if !partition.seen.lock().insert(chash) {
                continue;
            }
            if let Some(store) = trigger.store.ancestor_at(phash) {
                let _ = partition.store.set(Arc::clone(store));
            }

            let inputs = ResolvedInputs::new(&self.input_names, &ready.stores);
            let index = Arc::clone(trigger.store.index());
            let step = run_user(&self.name, &index, || {
                let mut acc = partition.accumulator.lock();
                match acc.as_mut() {
                    Some(acc) => (self.ops.step)(acc.as_mut(), &inputs),
                    // Late contribution after finalization; nothing to
                    // fold into.
                    None => Ok(()),
                }
            });
            match step {
                Ok(()) => {
                    self.invoked.fetch_add(1, Ordering::Relaxed);
                    partition.counter.increment();
                    self.maybe_finalize(phash, &partition, ctx, guard);
                }
                Err(err) => {
                    ctx.publish(Published::Error(err), guard);
                    return;
                }
            }
        }
    }

    fn on_flush(&self, msg: &Message, ctx: &NodeCtx, guard: &WorkGuard) {
        self.group.flush(msg);

        if msg.store.source() != self.flush_source
            || msg.store.layer_name() != self.partition_layer
        {
            return;
        }
        let phash = msg.store.index().hash();
        let partition = self.partition(phash);
        // A flush store shares its index with the data store it follows.
        if let Some(parent) = msg.store.parent() {
            if parent.index().hash() == phash {
                let _ = partition.store.set(Arc::clone(parent));
            }
        }
        let _ = partition.eom.set(msg.eom.clone());
        let expected = msg
            .store
            .flush_counts()
            .and_then(|counts| counts.count_for_name(&self.expected_layer))
            .unwrap_or(0);
        partition
            .counter
            .set_expected(expected, msg.store.original_id().unwrap_or(msg.id));
        self.maybe_finalize(phash, &partition, ctx, guard);
    }

    fn maybe_finalize(
        &self,
        phash: IndexHash,
        partition: &Arc<Partition>,
        ctx: &NodeCtx,
        guard: &WorkGuard,
    ) {
        if !partition.counter.is_complete() || !partition.counter.claim_finalize() {
            return;
        }
        let Some(acc) = partition.accumulator.lock().take() else {
            return;
        };
        let Some(base) = partition.store.get() else {
            tracing::warn!(
                node = %self.name,
                partition = phash,
                "fold partition completed without a partition store"
            );
            return;
        };
        let products = (self.ops.publish)(acc);
        let store = base.make_continuation(self.name.as_ref(), products);
        let message = Message {
            store,
            eom: partition.eom.get().cloned().flatten(),
            id: next_message_id(),
            original_id: partition.counter.original_id(),
        };
        ctx.publish(Published::Message(message), guard);
        self.published.fetch_add(1, Ordering::Relaxed);
    }
}

impl Node for FoldNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(self: Arc<Self>, input: NodeInput, ctx: &NodeCtx, guard: WorkGuard) {
        match input {
            NodeInput::Data(msg) => self.on_data(&msg, ctx, &guard),
            NodeInput::Flush(msg) => self.on_flush(&msg, ctx, &guard),
            NodeInput::Decision { .. } => {}
        }
    }

    fn finish(&self) -> NodeStats {
        let open = self
            .partitions
            .iter()
            .filter(|p| !p.counter.is_finalized())
            .count();
        NodeStats {
            invoked: self.invoked.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            residual: self.group.residual() + open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;
    use tokio::sync::mpsc;

    use crate::graph::binding::box_fold;
    use crate::graph::engine::{Pending, WorkGuard};
    use crate::graph::ports::{PortConfig, ProductQuery};
    use crate::model::{FlushCounts, ProductMap, ProductStore};

    fn sum_node() -> Arc<FoldNode> {
        let port = PortConfig {
            query: ProductQuery::new("n"),
            producer: "Source".into(),
            via_repeater: false,
        };
        Arc::new(FoldNode::new(
            Arc::from("sum"),
            InputGroup::new(smallvec![port]),
            box_fold(0_u64, |acc: &mut u64, n: &u64| *acc += *n, "total".into()),
            vec!["n".into()],
            "run".into(),
            "event".into(),
            "Source".into(),
        ))
    }

    struct Harness {
        ctx: NodeCtx,
        rx: mpsc::UnboundedReceiver<(Published, WorkGuard)>,
        pending: Arc<Pending>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                ctx: NodeCtx::new(tx),
                rx,
                pending: Pending::new(),
            }
        }

        fn guard(&self) -> WorkGuard {
            WorkGuard::new(Arc::clone(&self.pending))
        }

        fn published_total(&mut self) -> Option<u64> {
            match self.rx.try_recv().ok()? {
                (Published::Message(msg), _guard) => {
                    Some(*msg.store.get::<u64>("total").unwrap())
                }
                (other, _guard) => panic!("unexpected publication: {other:?}"),
            }
        }
    }

    fn run_store() -> Arc<ProductStore> {
        ProductStore::base("Source").make_child(0, "run", "Source", ProductMap::new())
    }

    fn event_msg(run: &Arc<ProductStore>, number: u64, n: u64) -> Message {
        let mut products = ProductMap::new();
        products.insert("n", n);
        let store = run.make_child(number, "event", "Source", products);
        Message {
            store,
            eom: None,
            id: next_message_id(),
            original_id: None,
        }
    }

    fn flush_msg(run: &Arc<ProductStore>, count: usize) -> Message {
        let counts =
            FlushCounts::single("event", run.index().child_layer_hash("event"), count);
        let store = run.make_flush("Source", counts, next_message_id());
        Message {
            store,
            eom: None,
            id: next_message_id(),
            original_id: None,
        }
    }

    /// Contributions first, then the flush: the flush's promise is already
    /// met, so it finalizes the partition on the spot.
    #[test]
    fn finalizes_once_when_flush_arrives_last() {
        let node = sum_node();
        let mut h = Harness::new();
        let run = run_store();

        node.on_data(&event_msg(&run, 1, 3), &h.ctx, &h.guard());
        node.on_data(&event_msg(&run, 2, 5), &h.ctx, &h.guard());
        assert!(h.published_total().is_none());

        node.on_flush(&flush_msg(&run, 2), &h.ctx, &h.guard());
        assert_eq!(h.published_total(), Some(8));
        assert!(h.published_total().is_none());

        let stats = node.finish();
        assert_eq!(stats.invoked, 2);
        assert_eq!(stats.published, 1);
        assert_eq!(stats.residual, 0);
    }

    /// Flush first: the promise is recorded and the partition finalizes
    /// only when the last contribution lands.
    #[test]
    fn finalizes_once_when_flush_arrives_first() {
        let node = sum_node();
        let mut h = Harness::new();
        let run = run_store();

        node.on_flush(&flush_msg(&run, 2), &h.ctx, &h.guard());
        node.on_data(&event_msg(&run, 1, 3), &h.ctx, &h.guard());
        assert!(h.published_total().is_none());

        node.on_data(&event_msg(&run, 2, 5), &h.ctx, &h.guard());
        assert_eq!(h.published_total(), Some(8));
        assert!(h.published_total().is_none());
    }

    /// A re-delivered contribution is folded in only once.
    #[test]
    fn duplicate_contributions_fold_once() {
        let node = sum_node();
        let mut h = Harness::new();
        let run = run_store();

        let first = event_msg(&run, 1, 3);
        node.on_data(&first, &h.ctx, &h.guard());
        node.on_data(&first, &h.ctx, &h.guard());
        node.on_flush(&flush_msg(&run, 1), &h.ctx, &h.guard());

        assert_eq!(h.published_total(), Some(3));
        assert_eq!(node.finish().invoked, 1);
    }
}
