//! Output nodes: terminal sinks that hand matched products to a
//! persistence backend. An output watches exactly one (producer, product)
//! pair and only fires on stores that directly hold it, so repeated
//! chain visibility of the same datum never writes twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::RuntimeError;
use crate::graph::decision::{Gate, Released};
use crate::graph::engine::WorkGuard;
use crate::graph::flags::OnceCache;
use crate::graph::nodes::{Node, NodeCtx, NodeInput, NodeStats, Published};
use crate::graph::ports::Ready;
use crate::persist::Persistence;

pub(crate) struct OutputNode {
    name: Arc<str>,
    /// Product name this sink persists.
    product: String,
    /// Only stores published by this component match.
    producer: String,
    backend: Arc<dyn Persistence>,
    gate: Option<Gate>,
    cache: OnceCache,
    written: AtomicU64,
}

impl OutputNode {
    pub fn new(
        name: Arc<str>,
        product: String,
        producer: String,
        backend: Arc<dyn Persistence>,
        when: Vec<String>,
    ) -> Self {
        let gate = (!when.is_empty()).then(|| Gate::new(when));
        Self {
            name,
            product,
            producer,
            backend,
            gate,
            cache: OnceCache::new(),
            written: AtomicU64::new(0),
        }
    }

    pub fn matches(&self, store: &crate::model::ProductStore) -> bool {
        store.source() == self.producer && store.contains(&self.product)
    }

    fn dispatch(&self, ready: Ready, ctx: &NodeCtx, guard: &WorkGuard) {
        match &self.gate {
            Some(gate) => match gate.admit(ready) {
                Some(Released::Run(ready)) => self.write(&ready, ctx, guard),
                Some(Released::Retire(ready)) => self.retire(&ready),
                None => {}
            },
            None => self.write(&ready, ctx, guard),
        }
    }

    fn write(&self, ready: &Ready, ctx: &NodeCtx, guard: &WorkGuard) {
        let store = &ready.stores[0];
        let index = store.index();
        let hash = index.hash();
        let Some(flag) = self.cache.try_claim(hash, ready.trigger.id) else {
            return;
        };
        let Some(product) = store.product(&self.product) else {
            return;
        };
        match self.backend.write(&self.product, product, index) {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
                self.cache.done(&flag);
            }
            Err(err) => ctx.publish(
                Published::Error(RuntimeError::Algorithm {
                    node: self.name.to_string(),
                    index: index.to_string(),
                    message: err.to_string(),
                }),
                guard,
            ),
        }
    }

    fn retire(&self, ready: &Ready) {
        let hash = ready.trigger.store.index().hash();
        if let Some(flag) = self.cache.try_claim(hash, ready.trigger.id) {
            self.cache.done(&flag);
        }
    }
}

impl Node for OutputNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(self: Arc<Self>, input: NodeInput, ctx: &NodeCtx, guard: WorkGuard) {
        match input {
            NodeInput::Data(msg) => {
                if !self.matches(&msg.store) {
                    return;
                }
                let ready = Ready {
                    stores: SmallVec::from_iter([Arc::clone(&msg.store)]),
                    trigger: msg,
                };
                self.dispatch(ready, ctx, &guard);
            }
            NodeInput::Flush(_) => {}
            NodeInput::Decision { predicate, result } => {
                if let Some(gate) = &self.gate {
                    for released in gate.on_decision(&predicate, result) {
                        match released {
                            Released::Run(ready) => self.write(&ready, ctx, &guard),
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
            invoked: self.written.load(Ordering::Relaxed),
            published: 0,
            residual: self.cache.residual() + gate_residual,
        }
    }
}
