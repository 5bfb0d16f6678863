//! The Driving Source
//!
//! One user-supplied closure drives the whole run by yielding product
//! stores in hierarchy order: a parent's store before its children, a
//! cell's store before its sibling's. The closure runs on its own OS
//! thread and feeds the router through a bounded channel of capacity
//! one, so the source can never run ahead of the graph by more than a
//! single cell. The send is the source's only suspension point.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

use crate::graph::engine::Pending;
use crate::model::{ProductMap, ProductStore};

pub(crate) type SourceFn = Box<dyn FnOnce(SourceSink) + Send + 'static>;

/// Handle the source closure yields stores through.
pub struct SourceSink {
    tx: mpsc::Sender<Arc<ProductStore>>,
    pending: Arc<Pending>,
    base: Arc<ProductStore>,
}

impl SourceSink {
    pub(crate) fn new(
        tx: mpsc::Sender<Arc<ProductStore>>,
        pending: Arc<Pending>,
        base: Arc<ProductStore>,
    ) -> Self {
        Self { tx, pending, base }
    }

    /// The root store of the run. Child stores are derived from it with
    /// [`ProductStore::make_child`].
    pub fn base(&self) -> &Arc<ProductStore> {
        &self.base
    }

    /// Convenience: derive and yield a child of `parent` in one call.
    /// Returns the child store for deeper derivation, or `None` once the
    /// run is shutting down.
    pub fn emit_child(
        &self,
        parent: &Arc<ProductStore>,
        number: u64,
        layer: &str,
        products: ProductMap,
    ) -> Option<Arc<ProductStore>> {
        let child = parent.make_child(number, layer, self.base.source(), products);
        self.yield_store(Arc::clone(&child)).then_some(child)
    }

    /// Hand one store to the graph, blocking until the router takes it.
    /// Returns `false` once the run has aborted; the closure should stop
    /// yielding.
    pub fn yield_store(&self, store: Arc<ProductStore>) -> bool {
        if self.pending.is_aborted() {
            return false;
        }
        self.tx.blocking_send(store).is_ok()
    }
}

/// Run the source closure on a dedicated thread. Dropping the sink when
/// the closure returns closes the channel, which is the router's
/// end-of-input signal.
pub(crate) fn spawn_source(
    name: &str,
    driver: SourceFn,
    pending: Arc<Pending>,
) -> std::io::Result<(mpsc::Receiver<Arc<ProductStore>>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(1);
    let base = ProductStore::base(name);
    let sink = SourceSink::new(tx, pending, base);
    let thread = std::thread::Builder::new()
        .name("strata-source".to_string())
        .spawn(move || driver(sink))?;
    Ok((rx, thread))
}
