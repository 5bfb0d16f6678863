//! Transform nodes: pure functions from input products to new products,
//! published as a continuation of the invocation's position under the
//! trigger's message id. A transform whose inputs all sit at a coarser
//! layer runs once per coarse cell and publishes there, even though
//! descendant messages resolve the same inputs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::graph::binding::{BoxedTransform, ResolvedInputs};
use crate::graph::decision::{Gate, Released};
use crate::graph::flags::OnceCache;
use crate::graph::message::Message;
use crate::graph::nodes::{run_user, Concurrency, Node, NodeCtx, NodeInput, NodeStats, Published};
use crate::graph::ports::{InputGroup, Ready};
use crate::graph::engine::WorkGuard;

pub(crate) struct TransformNode {
    name: Arc<str>,
    group: InputGroup,
    gate: Option<Gate>,
    cache: OnceCache,
    body: BoxedTransform,
    input_names: Vec<String>,
    concurrency: Concurrency,
    invoked: AtomicU64,
    published: AtomicU64,
}

impl TransformNode {
    pub fn new(
        name: Arc<str>,
        group: InputGroup,
        when: Vec<String>,
        body: BoxedTransform,
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
            // Re-delivery of an already claimed position. The downstream
            // continuation is reachable through the store chain, so
            // nothing is republished.
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

    fn run_one(
        &self,
        ready: Ready,
        flag: Arc<crate::graph::flags::StoreFlag>,
        ctx: &NodeCtx,
        guard: &WorkGuard,
    ) {
        let inputs = ResolvedInputs::new(&self.input_names, &ready.stores);
        let position = Arc::clone(ready.position());
        let index = Arc::clone(position.index());
        match run_user(&self.name, &index, || (self.body)(&inputs)) {
            Ok(products) => {
                self.invoked.fetch_add(1, Ordering::Relaxed);
                let store = position.make_continuation(self.name.as_ref(), products);
                ctx.publish(
                    Published::Message(Message::continuation(store, &ready.trigger)),
                    guard,
                );
                self.published.fetch_add(1, Ordering::Relaxed);
                self.cache.done(&flag);
            }
            Err(err) => ctx.publish(Published::Error(err), guard),
        }
    }

    /// A rejected position still claims its slot so a later re-delivery
    /// cannot run it.
    fn retire(&self, ready: &Ready) {
        let hash = ready.position().index().hash();
        if let Some(flag) = self.cache.try_claim(hash, ready.trigger.id) {
            self.cache.done(&flag);
        }
    }
}

impl Node for TransformNode {
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

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;
    use tokio::sync::mpsc;

    use crate::graph::binding::box_transform;
    use crate::graph::engine::{Pending, WorkGuard};
    use crate::graph::message::next_message_id;
    use crate::graph::ports::{PortConfig, ProductQuery};
    use crate::model::{ProductMap, ProductStore};

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

        fn published_store(&mut self) -> Option<Arc<ProductStore>> {
            match self.rx.try_recv().ok()? {
                (Published::Message(msg), _guard) => Some(msg.store),
                (other, _guard) => panic!("unexpected publication: {other:?}"),
            }
        }
    }

    fn node(query: ProductQuery, body: BoxedTransform, input: &str) -> Arc<TransformNode> {
        let port = PortConfig {
            query,
            producer: "Source".into(),
            via_repeater: false,
        };
        Arc::new(TransformNode::new(
            Arc::from("calc"),
            InputGroup::new(smallvec![port]),
            Vec::new(),
            body,
            vec![input.into()],
            Concurrency::Serial,
        ))
    }

    fn data_msg(store: Arc<ProductStore>) -> Message {
        Message {
            store,
            eom: None,
            id: next_message_id(),
            original_id: None,
        }
    }

    /// Re-delivery of an already executed position runs nothing and
    /// publishes nothing; the first continuation stands.
    #[test]
    fn re_delivered_positions_run_once() {
        let node = node(
            ProductQuery::new("hits"),
            box_transform(|hits: &Vec<u32>| hits.len(), "count".into()),
            "hits",
        );
        let mut h = Harness::new();

        let run = ProductStore::base("Source").make_child(0, "run", "Source", ProductMap::new());
        let mut products = ProductMap::new();
        products.insert("hits", vec![1_u32, 2, 3]);
        let event = run.make_child(1, "event", "Source", products);

        Arc::clone(&node).accept(
            NodeInput::Data(data_msg(Arc::clone(&event))),
            &h.ctx,
            h.guard(),
        );
        Arc::clone(&node).accept(NodeInput::Data(data_msg(event)), &h.ctx, h.guard());

        let store = h.published_store().unwrap();
        assert_eq!(*store.get::<usize>("count").unwrap(), 3);
        assert!(h.published_store().is_none());

        let stats = node.finish();
        assert_eq!(stats.invoked, 1);
        assert_eq!(stats.published, 1);
        assert_eq!(stats.residual, 0);
    }

    /// An input qualified to a coarser layer executes once per coarse
    /// cell and publishes at that layer, no matter how many descendant
    /// messages resolve it through their ancestor chains.
    #[test]
    fn coarse_input_runs_once_per_coarse_cell() {
        let node = node(
            ProductQuery::new("raw_geometry").at_layer("run"),
            box_transform(|raw: &f64| raw * 2.0, "geometry".into()),
            "raw_geometry",
        );
        let mut h = Harness::new();

        let mut run_products = ProductMap::new();
        run_products.insert("raw_geometry", 2.5_f64);
        let run =
            ProductStore::base("Source").make_child(0, "run", "Source", run_products);

        Arc::clone(&node).accept(
            NodeInput::Data(data_msg(Arc::clone(&run))),
            &h.ctx,
            h.guard(),
        );
        for number in 1..=4u64 {
            let event = run.make_child(number, "event", "Source", ProductMap::new());
            Arc::clone(&node).accept(NodeInput::Data(data_msg(event)), &h.ctx, h.guard());
        }

        let store = h.published_store().unwrap();
        assert_eq!(store.layer_name(), "run");
        assert_eq!(*store.get::<f64>("geometry").unwrap(), 5.0);
        assert!(h.published_store().is_none());

        let stats = node.finish();
        assert_eq!(stats.invoked, 1);
        assert_eq!(stats.published, 1);
        assert_eq!(stats.residual, 0);
    }
}
