//! Observer nodes: side effects only. They receive fully joined inputs
//! exactly once per position and publish nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::graph::binding::{BoxedObserver, ResolvedInputs};
use crate::graph::decision::{Gate, Released};
use crate::graph::engine::WorkGuard;
use crate::graph::flags::{OnceCache, StoreFlag};
use crate::graph::nodes::{run_user, Concurrency, Node, NodeCtx, NodeInput, NodeStats, Published};
use crate::graph::ports::{InputGroup, Ready};

pub(crate) struct ObserverNode {
    name: Arc<str>,
    group: InputGroup,
    gate: Option<Gate>,
    cache: OnceCache,
    body: BoxedObserver,
    input_names: Vec<String>,
    concurrency: Concurrency,
    invoked: AtomicU64,
}

impl ObserverNode {
    pub fn new(
        name: Arc<str>,
        group: InputGroup,
        when: Vec<String>,
        body: BoxedObserver,
        input_names: Vec<String>,
        concurrency: Concurrency,
    ) -> Self {
        let gate = (!when.is_empty()).then(|| Gate::new(when));
        Self {
            name,
            group,
            gate,
            cache: OnceCache::new(),
            body,
            input_names,
            concurrency,
            invoked: AtomicU64::new(0),
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
        let inputs = ResolvedInputs::new(&self.input_names, &ready.stores);
        let index = Arc::clone(ready.position().index());
        match run_user(&self.name, &index, || (self.body)(&inputs)) {
            Ok(()) => {
                self.invoked.fetch_add(1, Ordering::Relaxed);
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

impl Node for ObserverNode {
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
            published: 0,
            residual: self.group.residual() + self.cache.residual() + gate_residual,
        }
    }
}
