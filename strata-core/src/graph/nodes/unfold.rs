//! Unfold nodes: expand one cell into a run of child cells at a deeper
//! layer, followed by a flush that promises the child count.
//!
//! Each child carries its own fresh message id and an end-of-message
//! token derived from the trigger's; the trailing flush shares the
//! trigger's index and names the trigger's id as its original, which is
//! what lets folds over the children close their partitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::graph::binding::{BoxedUnfold, ResolvedInputs};
use crate::graph::decision::{Gate, Released};
use crate::graph::engine::WorkGuard;
use crate::graph::flags::{OnceCache, StoreFlag};
use crate::graph::message::{next_message_id, Message};
use crate::graph::nodes::{run_user, Concurrency, Node, NodeCtx, NodeInput, NodeStats, Published};
use crate::graph::ports::{InputGroup, Ready};
use crate::model::FlushCounts;

pub(crate) struct UnfoldNode {
    name: Arc<str>,
    group: InputGroup,
    gate: Option<Gate>,
    cache: OnceCache,
    driver: BoxedUnfold,
    input_names: Vec<String>,
    /// Layer the generated children live at.
    new_layer: String,
    concurrency: Concurrency,
    invoked: AtomicU64,
    published: AtomicU64,
}

impl UnfoldNode {
    pub fn new(
        name: Arc<str>,
        group: InputGroup,
        when: Vec<String>,
        driver: BoxedUnfold,
        input_names: Vec<String>,
        new_layer: String,
        concurrency: Concurrency,
    ) -> Self {
        let gate = (!when.is_empty()).then(|| Gate::new(when));
        Self {
            name,
            group,
            gate,
            cache: OnceCache::new(),
            driver,
            input_names,
            new_layer,
            concurrency,
            invoked: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    fn dispatch(self: &Arc<Self>, ready: Ready, ctx: &NodeCtx, guard: &WorkGuard) {
        match &self.gate {
            Some(gate) => match gate.admit(ready) {
                Some(Released::Run(ready)) => self.execute(ready, ctx, guard),
                Some(Released::Retire(ready)) => self.retire(&ready),
                None => {}
            },
            None => self.execute(ready, ctx, guard),
        }
    }

    fn execute(self: &Arc<Self>, ready: Ready, ctx: &NodeCtx, guard: &WorkGuard) {
        let hash = ready.position().index().hash();
        let Some(flag) = self.cache.try_claim(hash, ready.trigger.id) else {
            return;
        };
        match self.concurrency {
            Concurrency::Serial => self.run_one(ready, flag, ctx, guard),
            Concurrency::Unlimited => {
                let node = Arc::clone(self);
                let ctx = ctx.clone();
                let task_guard = guard.split();
                tokio::spawn(async move {
                    node.run_one(ready, flag, &ctx, &task_guard);
                });
            }
        }
    }

    fn run_one(&self, ready: Ready, flag: Arc<StoreFlag>, ctx: &NodeCtx, guard: &WorkGuard) {
        let trigger = &ready.trigger;
        let inputs = ResolvedInputs::new(&self.input_names, &ready.stores);
        let position = Arc::clone(ready.position());
        let index = Arc::clone(position.index());
        // End-of-message marker at the position's own depth; identical to
        // the trigger's marker unless every port resolved coarser.
        let position_eom = trigger
            .eom
            .as_ref()
            .and_then(|eom| eom.at_depth(index.depth()))
            .cloned();

        let mut child_number = 0u64;
        let mut emit = |products| {
            let store =
                position.make_child(child_number, &self.new_layer, self.name.as_ref(), products);
            let eom = position_eom
                .as_ref()
                .map(|eom| eom.make_child(Arc::clone(store.index())));
            ctx.publish(
                Published::Message(Message {
                    store,
                    eom,
                    id: next_message_id(),
                    original_id: None,
                }),
                guard,
            );
            self.published.fetch_add(1, Ordering::Relaxed);
            child_number += 1;
        };
        match run_user(&self.name, &index, || (self.driver)(&inputs, &mut emit)) {
            Ok(count) => {
                self.invoked.fetch_add(1, Ordering::Relaxed);
                let counts = FlushCounts::single(
                    &self.new_layer,
                    index.child_layer_hash(&self.new_layer),
                    count,
                );
                let flush_store = position.make_flush(self.name.as_ref(), counts, trigger.id);
                ctx.publish(
                    Published::Message(Message {
                        store: flush_store,
                        eom: position_eom,
                        id: next_message_id(),
                        original_id: Some(trigger.id),
                    }),
                    guard,
                );
                self.published.fetch_add(1, Ordering::Relaxed);
                self.cache.done(&flag);
            }
            Err(err) => ctx.publish(Published::Error(err), guard),
        }
    }

    fn retire(&self, ready: &Ready) {
        let hash = ready.position().index().hash();
        if let Some(flag) = self.cache.try_claim(hash, ready.trigger.id) {
            self.cache.done(&flag);
        }
    }
}

impl Node for UnfoldNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(self: Arc<Self>, input: NodeInput, ctx: &NodeCtx, guard: WorkGuard) {
        match input {
            NodeInput::Data(msg) => {
                for ready in self.group.offer(&msg) {
                    self.dispatch(ready, ctx, &guard);
                }
            }
            NodeInput::Flush(msg) => self.group.flush(&msg),
            NodeInput::Decision { predicate, result } => {
                if let Some(gate) = &self.gate {
                    for released in gate.on_decision(&predicate, result) {
                        match released {
                            Released::Run(ready) => self.execute(ready, ctx, &guard),
                            Released::Retire(ready) => self.retire(&ready),
                        }
                    }
                }
            }
        }
    }

    fn finish(&self) -> NodeStats {
        let gate_residual = self.gate.as_ref().map_or(0, Gate::residual);
        NodeStats {
            invoked: self.invoked.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            residual: self.group.residual() + self.cache.residual() + gate_residual,
        }
    }
}
