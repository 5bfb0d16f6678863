//! Execution Engine
//!
//! `Graph::execute` spins up the runtime: the source on its own OS
//! thread, one task per node, and the router task in between. Quiescence
//! is tracked by a single work count: every delivery and publication
//! holds a [`WorkGuard`], and the run is over once the source is
//! exhausted and the count drains to zero. The first runtime error
//! aborts the run; the remaining work is discarded and the error is
//! returned from `execute`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tokio::sync::{mpsc, Notify};

use crate::error::{Error, RuntimeError};
use crate::graph::multiplexer::{NodeHandle, Router};
use crate::graph::nodes::{Node, NodeCtx, NodeKind, NodeStats};
use crate::graph::ports::PortConfig;
use crate::graph::source::{spawn_source, SourceFn};
use crate::model::LayerHierarchy;

/// Shared work accounting: outstanding deliveries and publications, plus
/// the abort latch.
pub(crate) struct Pending {
    count: AtomicU64,
    aborted: AtomicBool,
    error: Mutex<Option<RuntimeError>>,
    notify: Notify,
}

impl Pending {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
            error: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_one();
        }
    }

    pub fn is_idle(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Latch the first error; later errors are dropped.
    pub fn abort(&self, err: RuntimeError) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            *self.error.lock() = Some(err);
        }
        self.notify.notify_one();
    }

    pub fn take_error(&self) -> Option<RuntimeError> {
        self.error.lock().take()
    }

    /// Resolves when the count drains to zero or the run aborts.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

/// One unit of outstanding work. Created at every send, dropped when the
/// receiver has fully handled the item.
pub(crate) struct WorkGuard {
    pending: Arc<Pending>,
}

impl WorkGuard {
    pub fn new(pending: Arc<Pending>) -> Self {
        pending.add();
        Self { pending }
    }

    /// A second guard over the same accounting, for work handed onward
    /// (publications, spawned invocations).
    pub fn split(&self) -> WorkGuard {
        WorkGuard::new(Arc::clone(&self.pending))
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.pending.release();
    }
}

/// A fully wired node, ready to run.
pub(crate) struct BuiltNode {
    pub name: Arc<str>,
    pub kind: NodeKind,
    pub node: Arc<dyn Node>,
    pub ports: SmallVec<[PortConfig; 4]>,
    pub output: Option<(String, String)>,
    pub provider_layer: Option<String>,
    pub when: Vec<String>,
}

/// End-of-run report: the layer census plus per-node statistics, in
/// registration order.
#[derive(Debug)]
pub struct RunSummary {
    /// (layer path, cells visited), sorted by path.
    pub layers: Vec<(String, u64)>,
    pub stats: IndexMap<String, NodeStats>,
}

impl RunSummary {
    /// Cells visited at the layer whose path ends with `layer`.
    pub fn cells(&self, layer: &str) -> u64 {
        let suffix = if layer.starts_with('/') {
            layer.to_string()
        } else {
            format!("/{layer}")
        };
        self.layers
            .iter()
            .filter(|(path, _)| path.ends_with(&suffix))
            .map(|(_, count)| count)
            .sum()
    }
}

/// An executable graph. Produced by `GraphBuilder::build`; consumed by a
/// single run.
pub struct Graph {
    pub(crate) source_name: String,
    pub(crate) source_fn: SourceFn,
    pub(crate) nodes: Vec<BuiltNode>,
}

impl Graph {
    /// Drive the source through the graph to quiescence.
    pub async fn execute(self) -> Result<RunSummary, Error> {
        let pending = Pending::new();
        let hierarchy = Arc::new(LayerHierarchy::new());

        let (source_rx, source_thread) =
            spawn_source(&self.source_name, self.source_fn, Arc::clone(&pending))
                .map_err(|e| Error::Executor(format!("source thread: {e}")))?;

        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let ctx = NodeCtx::new(feedback_tx);

        let mut handles = Vec::with_capacity(self.nodes.len());
        let mut tasks = Vec::with_capacity(self.nodes.len());
        let mut gated: FxHashMap<String, Vec<usize>> = FxHashMap::default();
        for (i, built) in self.nodes.iter().enumerate() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            handles.push(NodeHandle {
                name: Arc::clone(&built.name),
                kind: built.kind,
                ports: built.ports.clone(),
                output: built.output.clone(),
                provider_layer: built.provider_layer.clone(),
                tx,
            });
            for predicate in &built.when {
                gated.entry(predicate.clone()).or_default().push(i);
            }
            let node = Arc::clone(&built.node);
            let node_ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some((input, guard)) = rx.recv().await {
                    Arc::clone(&node).accept(input, &node_ctx, guard);
                }
            }));
        }
        drop(ctx);

        let router = Router::new(
            self.source_name.clone(),
            handles,
            gated,
            Arc::clone(&pending),
            Arc::clone(&hierarchy),
        );
        router.run(source_rx, feedback_rx).await;

        // The router dropped the node senders; the loops wind down.
        for task in tasks {
            let _ = task.await;
        }
        let source_panicked = source_thread.join().is_err();
        if source_panicked && !pending.is_aborted() {
            pending.abort(RuntimeError::Algorithm {
                node: self.source_name.clone(),
                index: "/".to_string(),
                message: "source thread panicked".to_string(),
            });
        }

        hierarchy.log_summary();
        let mut stats = IndexMap::new();
        for built in &self.nodes {
            let node_stats = built.node.finish();
            if node_stats.residual > 0 {
                tracing::warn!(
                    node = %built.name,
                    residual = node_stats.residual,
                    "unfinished work at shutdown"
                );
            }
            stats.insert(built.name.to_string(), node_stats);
        }

        match pending.take_error() {
            Some(err) => Err(err.into()),
            None => Ok(RunSummary {
                layers: hierarchy.totals(),
                stats,
            }),
        }
    }

    /// Blocking convenience wrapper around [`Graph::execute`].
    pub fn run(self) -> Result<RunSummary, Error> {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| Error::Executor(format!("runtime: {e}")))?;
        runtime.block_on(self.execute())
    }
}
