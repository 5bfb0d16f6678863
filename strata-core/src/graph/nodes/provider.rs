//! Provider nodes: conjure layer-scoped products from the cell index
//! alone, with no data inputs. Typical uses are conditions databases and
//! geometry lookups keyed by run or event number.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::graph::binding::BoxedProvider;
use crate::graph::engine::WorkGuard;
use crate::graph::flags::OnceCache;
use crate::graph::message::Message;
use crate::graph::nodes::{run_user, Node, NodeCtx, NodeInput, NodeStats, Published};

pub(crate) struct ProviderNode {
    name: Arc<str>,
    /// Layer whose cells trigger a lookup.
    layer: String,
    body: BoxedProvider,
    cache: OnceCache,
    invoked: AtomicU64,
    published: AtomicU64,
}

impl ProviderNode {
    pub fn new(name: Arc<str>, layer: String, body: BoxedProvider) -> Self {
        Self {
            name,
            layer,
            body,
            cache: OnceCache::new(),
            invoked: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    fn on_data(&self, msg: &Message, ctx: &NodeCtx, guard: &WorkGuard) {
        let index = Arc::clone(msg.store.index());
        if index.layer_name() != self.layer {
            return;
        }
        let hash = index.hash();
        let Some(flag) = self.cache.try_claim(hash, msg.id) else {
            return;
        };
        match run_user(&self.name, &index, || Ok((self.body)(&index))) {
            Ok(products) => {
                self.invoked.fetch_add(1, Ordering::Relaxed);
                let store = msg.store.make_continuation(self.name.as_ref(), products);
                ctx.publish(
                    Published::Message(Message::continuation(store, msg)),
                    guard,
                );
                self.published.fetch_add(1, Ordering::Relaxed);
                self.cache.done(&flag);
            }
            Err(err) => ctx.publish(Published::Error(err), guard),
        }
    }
}

impl Node for ProviderNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(self: Arc<Self>, input: NodeInput, ctx: &NodeCtx, guard: WorkGuard) {
        match input {
            NodeInput::Data(msg) => self.on_data(&msg, ctx, &guard),
            NodeInput::Flush(_) => {}
            NodeInput::Decision { .. } => {}
        }
    }

    fn finish(&self) -> NodeStats {
        NodeStats {
            invoked: self.invoked.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            residual: self.cache.residual(),
        }
    }
}
