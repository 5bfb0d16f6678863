//! Node Kinds
//!
//! Every vertex of the graph implements [`Node`]: it receives
//! [`NodeInput`]s from the router on its own channel and publishes
//! [`Published`] items back through the router's feedback channel. The
//! seven kinds differ in what they do with a completed join:
//!
//! - [`transform`]: pure function, output products at the trigger's layer
//! - [`predicate`]: boolean verdict, broadcast as a decision
//! - [`observer`]: side effects only, nothing published
//! - [`fold`]: accumulate fine-grained contributions into a coarser result
//! - [`unfold`]: expand one cell into a run of child cells plus a flush
//! - [`provider`]: conjure layer-scoped products from the index alone
//! - [`output`]: terminal sink, hands stores to a persistence backend
//!
//! Work accounting runs through [`WorkGuard`]s handed over with each
//! input; a node holding a guard keeps the engine from declaring
//! quiescence.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::RuntimeError;
use crate::graph::decision::PredicateResult;
use crate::graph::engine::WorkGuard;
use crate::graph::message::Message;
use crate::model::CellIndex;

pub(crate) mod fold;
pub(crate) mod observer;
pub(crate) mod output;
pub(crate) mod predicate;
pub(crate) mod provider;
pub(crate) mod transform;
pub(crate) mod unfold;

/// How many invocations of a node may run at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// One invocation at a time, in delivery order.
    #[default]
    Serial,
    /// Every ready invocation runs on its own task.
    Unlimited,
}

/// Per-node registration options.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub concurrency: Concurrency,
    /// Names of predicate nodes gating this node. Empty means ungated.
    pub when: Vec<String>,
}

impl NodeOptions {
    pub fn serial() -> Self {
        Self::default()
    }

    pub fn unlimited() -> Self {
        Self {
            concurrency: Concurrency::Unlimited,
            ..Self::default()
        }
    }

    pub fn when(mut self, predicate: impl Into<String>) -> Self {
        self.when.push(predicate.into());
        self
    }
}

/// The node kinds, for diagnostics and configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Transform,
    Predicate,
    Observer,
    Fold,
    Unfold,
    Provider,
    Output,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Transform => "transform",
            NodeKind::Predicate => "predicate",
            NodeKind::Observer => "observer",
            NodeKind::Fold => "fold",
            NodeKind::Unfold => "unfold",
            NodeKind::Provider => "provider",
            NodeKind::Output => "output",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery from the router to a node.
#[derive(Debug, Clone)]
pub(crate) enum NodeInput {
    Data(Message),
    Flush(Message),
    Decision {
        predicate: Arc<str>,
        result: PredicateResult,
    },
}

/// One item a node hands back to the router for distribution.
#[derive(Debug)]
pub(crate) enum Published {
    Message(Message),
    Decision {
        predicate: Arc<str>,
        result: PredicateResult,
    },
    /// Unrecoverable failure; the router aborts the run.
    Error(RuntimeError),
}

/// Shared handles a node uses while processing.
#[derive(Clone)]
pub(crate) struct NodeCtx {
    feedback: mpsc::UnboundedSender<(Published, WorkGuard)>,
}

impl NodeCtx {
    pub fn new(feedback: mpsc::UnboundedSender<(Published, WorkGuard)>) -> Self {
        Self { feedback }
    }

    /// Hand an item to the router. The guard keeps the engine live until
    /// the router has distributed it.
    pub fn publish(&self, item: Published, guard: &WorkGuard) {
        // Send failure means the router already shut down; the item is
        // dropped along with its guard.
        let _ = self.feedback.send((item, guard.split()));
    }
}

/// End-of-run report from one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Completed invocations of the user function.
    pub invoked: u64,
    /// Messages or decisions published.
    pub published: u64,
    /// Joins never completed, claims never finished, work still parked.
    /// Nonzero values are logged as warnings at shutdown.
    pub residual: usize,
}

/// A graph vertex. `accept` may run work inline (serial nodes) or spawn
/// it (unlimited nodes), moving the guard into the spawned task.
pub(crate) trait Node: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn accept(self: Arc<Self>, input: NodeInput, ctx: &NodeCtx, guard: WorkGuard);
    fn finish(&self) -> NodeStats;
}

/// Run a user function, converting a panic into an algorithm error so one
/// misbehaving body aborts the run instead of the process.
pub(crate) fn run_user<R>(
    node: &str,
    index: &CellIndex,
    f: impl FnOnce() -> Result<R, RuntimeError>,
) -> Result<R, RuntimeError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "panic with non-string payload".to_string()
            };
            Err(RuntimeError::Algorithm {
                node: node.to_string(),
                index: index.to_string(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CellIndex;

    #[test]
    fn panics_become_algorithm_errors() {
        let index = CellIndex::base();
        let err = run_user::<()>("noisy", &index, || panic!("bad input: {}", 7)).unwrap_err();
        match err {
            RuntimeError::Algorithm { node, message, .. } => {
                assert_eq!(node, "noisy");
                assert_eq!(message, "bad input: 7");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn explicit_errors_pass_through() {
        let index = CellIndex::base();
        let err = run_user::<()>("strict", &index, || {
            Err(RuntimeError::UnresolvedProduct {
                name: "hits".into(),
                index: index.to_string(),
            })
        })
        .unwrap_err();
        assert!(matches!(err, RuntimeError::UnresolvedProduct { .. }));
    }
}
