//! The Router
//!
//! A single task owns all message distribution. It interleaves two
//! streams:
//!
//! - stores from the driving source, which it wraps in messages, tracks
//!   with a sentry stack, and retires with synthesized flushes as the
//!   source backs out of each hierarchy position, and
//! - items published by nodes (continuations, child cells, flushes,
//!   predicate decisions, errors), which it fans out to every interested
//!   consumer.
//!
//! Delivery is interest-based: a data message reaches a node when any of
//! the node's ports resolves against the message's store chain, with the
//! node's own publications never routed back to itself. Flushes are
//! broadcast to everyone. The router exits once the source is exhausted
//! and the engine's work count has drained, or immediately on abort.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tokio::sync::mpsc;

use crate::graph::decision::PredicateResult;
use crate::graph::engine::{Pending, WorkGuard};
use crate::graph::message::{next_message_id, EndOfMessage, Message};
use crate::graph::nodes::{NodeInput, NodeKind, Published};
use crate::graph::ports::{resolve_port, PortConfig};
use crate::model::{CellIndex, FlushCounters, LayerHierarchy, ProductStore};

/// The router's view of one node: just enough to decide deliveries.
pub(crate) struct NodeHandle {
    pub name: Arc<str>,
    pub kind: NodeKind,
    pub ports: SmallVec<[PortConfig; 4]>,
    /// Output nodes match directly on (product, producer).
    pub output: Option<(String, String)>,
    /// Provider nodes trigger on source cells at this layer.
    pub provider_layer: Option<String>,
    pub tx: mpsc::UnboundedSender<(NodeInput, WorkGuard)>,
}

impl NodeHandle {
    fn wants(&self, store: &Arc<ProductStore>, source_name: &str) -> bool {
        // A node never consumes its own publications.
        if store.source() == self.name.as_ref() {
            return false;
        }
        match self.kind {
            NodeKind::Output => self.output.as_ref().is_some_and(|(product, producer)| {
                store.source() == producer && store.contains(product)
            }),
            NodeKind::Provider => self.provider_layer.as_deref().is_some_and(|layer| {
                store.source() == source_name && store.layer_name() == layer
            }),
            _ => self.ports.iter().any(|p| resolve_port(store, p).is_some()),
        }
    }
}

/// An open hierarchy position the source has entered but not yet left.
struct LayerSentry {
    index: Arc<CellIndex>,
    store: Arc<ProductStore>,
    eom: Arc<EndOfMessage>,
    msg_id: u64,
}

pub(crate) struct Router {
    source_name: String,
    nodes: Vec<NodeHandle>,
    /// Predicate name -> indices of nodes gated on it.
    gated: FxHashMap<String, Vec<usize>>,
    pending: Arc<Pending>,
    hierarchy: Arc<LayerHierarchy>,
    counters: FlushCounters,
    sentries: Vec<LayerSentry>,
}

impl Router {
    pub fn new(
        source_name: String,
        nodes: Vec<NodeHandle>,
        gated: FxHashMap<String, Vec<usize>>,
        pending: Arc<Pending>,
        hierarchy: Arc<LayerHierarchy>,
    ) -> Self {
        Self {
            source_name,
            nodes,
            gated,
            pending,
            hierarchy,
            counters: FlushCounters::new(),
            sentries: Vec::new(),
        }
    }

    pub async fn run(
        mut self,
        mut source_rx: mpsc::Receiver<Arc<ProductStore>>,
        mut feedback_rx: mpsc::UnboundedReceiver<(Published, WorkGuard)>,
    ) {
        let mut source_done = false;
        loop {
            if self.pending.is_aborted() {
                break;
            }
            if source_done && self.pending.is_idle() {
                break;
            }
            tokio::select! {
                maybe = source_rx.recv(), if !source_done => match maybe {
                    Some(store) => self.on_source(store),
                    None => {
                        source_done = true;
                        self.backout_to(0);
                    }
                },
                maybe = feedback_rx.recv() => {
                    if let Some((item, guard)) = maybe {
                        self.on_feedback(item, guard);
                    }
                },
                // Wakes when the work count drains or the run aborts.
                _ = self.pending.changed(), if source_done => {}
            }
        }
        // Dropping the node senders ends every node loop.
    }

    fn on_source(&mut self, store: Arc<ProductStore>) {
        let index = Arc::clone(store.index());
        self.backout_to(index.depth());
        self.counters.update(&index);
        self.hierarchy.record(&index);

        let eom = match self.sentries.last() {
            Some(parent) => parent.eom.make_child(Arc::clone(&index)),
            None => EndOfMessage::base(Arc::clone(&index)),
        };
        let msg_id = next_message_id();
        self.sentries.push(LayerSentry {
            index,
            store: Arc::clone(&store),
            eom: Arc::clone(&eom),
            msg_id,
        });
        self.dispatch_data(Message {
            store,
            eom: Some(eom),
            id: msg_id,
            original_id: None,
        });
    }

    /// Pop every sentry at `depth` or deeper, deepest first, emitting one
    /// flush per popped position with the child counts seen under it.
    fn backout_to(&mut self, depth: usize) {
        while self
            .sentries
            .last()
            .map_or(false, |top| top.index.depth() >= depth)
        {
            let Some(top) = self.sentries.pop() else {
                break;
            };
            let counts = self.counters.extract(&top.index);
            let flush_store = top.store.make_flush(&self.source_name, counts, top.msg_id);
            self.broadcast_flush(Message {
                store: flush_store,
                eom: Some(top.eom),
                id: next_message_id(),
                original_id: Some(top.msg_id),
            });
        }
    }

    fn on_feedback(&mut self, item: Published, guard: WorkGuard) {
        match item {
            Published::Message(msg) => {
                if msg.is_flush() {
                    self.broadcast_flush(msg);
                } else {
                    // Node-created cells (unfold children) join the census.
                    // Continuations keep their trigger's index and are not
                    // new positions.
                    let new_cell = msg
                        .store
                        .parent()
                        .map_or(true, |p| p.index().hash() != msg.store.index().hash());
                    if msg.store.source() != self.source_name && new_cell {
                        self.hierarchy.record(msg.store.index());
                    }
                    self.dispatch_data(msg);
                }
            }
            Published::Decision { predicate, result } => {
                self.dispatch_decision(&predicate, result);
            }
            Published::Error(err) => {
                tracing::error!(error = %err, "aborting run");
                self.pending.abort(err);
            }
        }
        drop(guard);
    }

    fn dispatch_data(&self, msg: Message) {
        for node in &self.nodes {
            if node.wants(&msg.store, &self.source_name) {
                self.deliver(node, NodeInput::Data(msg.clone()));
            }
        }
    }

    fn broadcast_flush(&self, msg: Message) {
        for node in &self.nodes {
            self.deliver(node, NodeInput::Flush(msg.clone()));
        }
    }

    fn dispatch_decision(&self, predicate: &Arc<str>, result: PredicateResult) {
        let Some(consumers) = self.gated.get(predicate.as_ref()) else {
            return;
        };
        for &i in consumers {
            self.deliver(
                &self.nodes[i],
                NodeInput::Decision {
                    predicate: Arc::clone(predicate),
                    result,
                },
            );
        }
    }

    fn deliver(&self, node: &NodeHandle, input: NodeInput) {
        let guard = WorkGuard::new(Arc::clone(&self.pending));
        // A closed channel means the node task is gone, which only
        // happens during shutdown.
        let _ = node.tx.send((input, guard));
    }
}
