//! Predicate nodes: boolean verdicts broadcast as decisions.
//!
//! A predicate runs once per hierarchical position. Re-deliveries of the
//! same position under a new message id republish the cached verdict
//! without re-invoking the body; deliveries that race the first
//! invocation park their message id until the verdict exists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::graph::binding::{BoxedPredicate, ResolvedInputs};
use crate::graph::decision::PredicateResult;
use crate::graph::engine::WorkGuard;
use crate::graph::flags::{OnceCache, StoreFlag};
use crate::graph::nodes::{run_user, Concurrency, Node, NodeCtx, NodeInput, NodeStats, Published};
use crate::graph::ports::{InputGroup, Ready};
use crate::model::IndexHash;

#[derive(Default)]
struct VerdictState {
    results: FxHashMap<IndexHash, bool>,
    /// Message ids that arrived while the position's verdict was still
    /// being computed.
    waiting: FxHashMap<IndexHash, SmallVec<[u64; 2]>>,
}

pub(crate) struct PredicateNode {
    name: Arc<str>,
    group: InputGroup,
    cache: OnceCache,
    state: Mutex<VerdictState>,
    body: BoxedPredicate,
    input_names: Vec<String>,
    concurrency: Concurrency,
    invoked: AtomicU64,
    published: AtomicU64,
}

impl PredicateNode {
    pub fn new(
        name: Arc<str>,
        group: InputGroup,
        body: BoxedPredicate,
        input_names: Vec<String>,
        concurrency: Concurrency,
    ) -> Self {
        Self {
            name,
            group,
            cache: OnceCache::new(),
            state: Mutex::new(VerdictState::default()),
            body,
            input_names,
            concurrency,
            invoked: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    fn announce(&self, msg_id: u64, value: bool, ctx: &NodeCtx, guard: &WorkGuard) {
        ctx.publish(
            Published::Decision {
                predicate: Arc::clone(&self.name),
                result: PredicateResult { msg_id, value },
            },
            guard,
        );
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn execute(self: &Arc<Self>, ready: Ready, ctx: &NodeCtx, guard: &WorkGuard) {
        let hash = ready.position().index().hash();
        {
            let mut state = self.state.lock();
            if let Some(&value) = state.results.get(&hash) {
                drop(state);
                self.announce(ready.trigger.id, value, ctx, guard);
                return;
            }
            let Some(flag) = self.cache.try_claim(hash, ready.trigger.id) else {
                // Claimed but not yet settled; park this id for the
                // verdict's publication.
                state.waiting.entry(hash).or_default().push(ready.trigger.id);
                return;
            };
            drop(state);
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
    }

    fn run_one(&self, ready: Ready, flag: Arc<StoreFlag>, ctx: &NodeCtx, guard: &WorkGuard) {
        let inputs = ResolvedInputs::new(&self.input_names, &ready.stores);
        let index = Arc::clone(ready.position().index());
        match run_user(&self.name, &index, || (self.body)(&inputs)) {
            Ok(value) => {
                self.invoked.fetch_add(1, Ordering::Relaxed);
                let hash = index.hash();
                let waiters = {
                    let mut state = self.state.lock();
                    state.results.insert(hash, value);
                    state.waiting.remove(&hash).unwrap_or_default()
                };
                self.announce(ready.trigger.id, value, ctx, guard);
                for msg_id in waiters {
                    self.announce(msg_id, value, ctx, guard);
                }
                self.cache.done(&flag);
            }
            Err(err) => ctx.publish(Published::Error(err), guard),
        }
    }
}

impl Node for PredicateNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(self: Arc<Self>, input: NodeInput, ctx: &NodeCtx, guard: WorkGuard) {
        match input {
            NodeInput::Data(msg) => {
                for ready in self.group.offer(&msg) {
                    self.execute(ready, ctx, &guard);
                }
            }
            NodeInput::Flush(msg) => self.group.flush(&msg),
            NodeInput::Decision { .. } => {}
        }
    }

    fn finish(&self) -> NodeStats {
        let waiting: usize = self.state.lock().waiting.values().map(SmallVec::len).sum();
        NodeStats {
            invoked: self.invoked.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            residual: self.group.residual() + self.cache.residual() + waiting,
        }
    }
}
