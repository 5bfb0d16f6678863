//! Product Queries and Input-Port Groups
//!
//! A [`ProductQuery`] is a node's declaration of one input: a product
//! name, optionally restricted to a hierarchy layer (`"geometry@run"`)
//! and/or a producing node (`"calib/geometry"`).
//!
//! An [`InputGroup`] is the runtime join stage in front of a node: it
//! resolves each incoming message against every port (walking the store's
//! ancestor chain), tag-matches partial deliveries by message id, and
//! routes coarser-layer ports through a [`Repeater`] when the group spans
//! hierarchy layers. A single-port group degenerates to a pass-through.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::graph::message::Message;
use crate::graph::repeater::Repeater;
use crate::model::{more_derived, most_derived, ProductStore, TypeTag};

/// Declaration of one input product, with optional layer and producer
/// qualifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductQuery {
    pub name: String,
    pub layer: Option<String>,
    pub producer: Option<String>,
}

impl ProductQuery {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layer: None,
            producer: None,
        }
    }

    /// Require the product to be scoped to a specific layer.
    pub fn at_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    /// Require the product to come from a specific node.
    pub fn from(mut self, producer: impl Into<String>) -> Self {
        self.producer = Some(producer.into());
        self
    }

    /// Parse the `"producer/name@layer"` shorthand; both qualifiers are
    /// optional.
    pub fn parse(spec: &str) -> Self {
        let (rest, layer) = match spec.split_once('@') {
            Some((rest, layer)) => (rest, Some(layer.to_string())),
            None => (spec, None),
        };
        let (producer, name) = match rest.split_once('/') {
            Some((producer, name)) => (Some(producer.to_string()), name),
            None => (None, rest),
        };
        Self {
            name: name.to_string(),
            layer,
            producer,
        }
    }

    /// Human-readable form for error messages.
    pub fn display(&self) -> String {
        let mut out = String::new();
        if let Some(producer) = &self.producer {
            out.push_str(producer);
            out.push('/');
        }
        out.push_str(&self.name);
        if let Some(layer) = &self.layer {
            out.push('@');
            out.push_str(layer);
        }
        out
    }
}

impl From<&str> for ProductQuery {
    fn from(spec: &str) -> Self {
        Self::parse(spec)
    }
}

impl From<String> for ProductQuery {
    fn from(spec: String) -> Self {
        Self::parse(&spec)
    }
}

/// One declared output of a node: product name plus its runtime type,
/// used for build-time producer/consumer matching. Unfold children carry
/// whatever products the generator emits, so their tags are unknown.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub name: String,
    pub tag: Option<TypeTag>,
}

impl OutputSpec {
    pub fn typed<T: Send + Sync + 'static>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: Some(TypeTag::of::<T>()),
        }
    }

    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: None,
        }
    }
}

/// A fully wired input port: the query plus the producer edge resolution
/// chose for it.
#[derive(Debug, Clone)]
pub(crate) struct PortConfig {
    pub query: ProductQuery,
    /// Name of the component whose stores satisfy this port ("the source"
    /// counts as a component).
    pub producer: String,
    /// Whether this port's data is replayed through a repeater (declared
    /// coarser layer, node-produced).
    pub via_repeater: bool,
}

/// Find the store in `store`'s ancestor chain that satisfies a wired port:
/// it must hold the product, sit at the declared layer (if any), and have
/// been produced by the resolved producer.
pub(crate) fn resolve_port<'a>(
    store: &'a Arc<ProductStore>,
    port: &PortConfig,
) -> Option<&'a Arc<ProductStore>> {
    let mut current = Some(store);
    while let Some(candidate) = current {
        if candidate.contains(&port.query.name)
            && candidate.source() == port.producer
            && port
                .query
                .layer
                .as_deref()
                .map_or(true, |layer| candidate.layer_name() == layer)
        {
            return Some(candidate);
        }
        current = candidate.parent();
    }
    None
}

/// A completed join: the triggering message plus one resolved store per
/// port, in declaration order.
#[derive(Debug, Clone)]
pub(crate) struct Ready {
    pub trigger: Message,
    pub stores: SmallVec<[Arc<ProductStore>; 4]>,
}

impl Ready {
    /// The hierarchy position this invocation runs at: the deepest
    /// resolved input store. A trigger at that same depth wins, so the
    /// full store chain stays reachable; only when every port resolved
    /// to a coarser ancestor does the position move up. Claims and
    /// published continuations key on this store, not the trigger, so a
    /// coarse-only node runs once per coarse cell no matter how many
    /// descendant messages re-resolve it.
    pub fn position(&self) -> &Arc<ProductStore> {
        let deepest = match most_derived(&self.stores) {
            Some(store) => store,
            None => return &self.trigger.store,
        };
        if self.trigger.store.index().depth() == deepest.index().depth() {
            &self.trigger.store
        } else {
            deepest
        }
    }
}

#[derive(Debug)]
struct PendingEntry {
    stores: SmallVec<[Option<Arc<ProductStore>>; 4]>,
    trigger: Option<Message>,
}

impl PendingEntry {
    fn new(arity: usize) -> Self {
        Self {
            stores: std::iter::repeat_with(|| None).take(arity).collect(),
            trigger: None,
        }
    }

    fn take_if_complete(&mut self) -> Option<Ready> {
        let stores: SmallVec<[Arc<ProductStore>; 4]> = self
            .stores
            .iter()
            .map(|s| s.as_ref().map(Arc::clone))
            .collect::<Option<_>>()?;
        let trigger = self.trigger.clone()?;
        Some(Ready { trigger, stores })
    }
}

/// The join stage in front of one node.
#[derive(Debug)]
pub(crate) struct InputGroup {
    ports: SmallVec<[PortConfig; 4]>,
    repeaters: FxHashMap<usize, Repeater>,
    pending: Mutex<FxHashMap<u64, PendingEntry>>,
    principal_layer: Mutex<Option<String>>,
}

impl InputGroup {
    pub fn new(ports: SmallVec<[PortConfig; 4]>) -> Self {
        let repeaters = ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.via_repeater)
            .map(|(i, _)| (i, Repeater::new()))
            .collect();
        Self {
            ports,
            repeaters,
            pending: Mutex::new(FxHashMap::default()),
            principal_layer: Mutex::new(None),
        }
    }

    pub fn ports(&self) -> &[PortConfig] {
        &self.ports
    }

    /// Whether any port of the group is satisfiable from this message.
    pub fn interested_in(&self, store: &Arc<ProductStore>) -> bool {
        self.ports.iter().any(|p| resolve_port(store, p).is_some())
    }

    /// Feed one data message through the join. Returns every invocation
    /// this message completes (a coarser datum can release several queued
    /// joins at once).
    pub fn offer(&self, msg: &Message) -> SmallVec<[Ready; 2]> {
        // Pass-through: one port, no buffering.
        if self.ports.len() == 1 {
            let mut ready = SmallVec::new();
            if let Some(store) = resolve_port(&msg.store, &self.ports[0]) {
                ready.push(Ready {
                    trigger: msg.clone(),
                    stores: SmallVec::from_iter([Arc::clone(store)]),
                });
            }
            return ready;
        }

        let mut completed: SmallVec<[Ready; 2]> = SmallVec::new();
        let mut pending = self.pending.lock();

        // Repeater data: a message whose own position sits at a coarser
        // port's declared layer carries the datum that port replays.
        for (i, port) in self.ports.iter().enumerate() {
            if !port.via_repeater {
                continue;
            }
            let at_data_layer = port
                .query
                .layer
                .as_deref()
                .is_some_and(|layer| msg.store.layer_name() == layer);
            if !at_data_layer {
                continue;
            }
            if let Some(store) = resolve_port(&msg.store, port) {
                let store = Arc::clone(store);
                let repeater = &self.repeaters[&i];
                for released in repeater.put_data(msg.store.index().hash(), Arc::clone(&store)) {
                    if let Some(entry) = pending.get_mut(&released) {
                        entry.stores[i] = Some(Arc::clone(&store));
                        if let Some(ready) = entry.take_if_complete() {
                            pending.remove(&released);
                            completed.push(ready);
                        }
                    }
                }
            }
        }

        // Principal path: fill every directly resolvable non-repeater port
        // under this message's tag.
        let fillable: SmallVec<[(usize, Arc<ProductStore>); 4]> = self
            .ports
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.via_repeater)
            .filter_map(|(i, p)| resolve_port(&msg.store, p).map(|s| (i, Arc::clone(s))))
            .collect();
        if fillable.is_empty() {
            return completed;
        }

        self.principal_layer
            .lock()
            .get_or_insert_with(|| msg.store.layer_name().to_string());

        let arity = self.ports.len();
        let entry = pending
            .entry(msg.id)
            .or_insert_with(|| PendingEntry::new(arity));
        for (i, store) in fillable {
            entry.stores[i] = Some(store);
        }
        entry.trigger = Some(match entry.trigger.take() {
            Some(existing)
                if Arc::ptr_eq(more_derived(&existing.store, &msg.store), &existing.store) =>
            {
                existing
            }
            _ => msg.clone(),
        });

        // Ask the repeaters for the coarser data this trigger needs.
        let trigger_index = Arc::clone(msg.store.index());
        for (i, port) in self.ports.iter().enumerate() {
            if !port.via_repeater || entry.stores[i].is_some() {
                continue;
            }
            let Some(layer) = port.query.layer.as_deref() else {
                continue;
            };
            if let Some(coarse) = trigger_index.parent_at(layer) {
                if let Some(store) = self.repeaters[&i].request(msg.id, coarse.hash()) {
                    entry.stores[i] = Some(store);
                }
            }
        }

        if let Some(ready) = entry.take_if_complete() {
            pending.remove(&msg.id);
            completed.push(ready);
        }
        completed
    }

    /// Flush handling: retire repeater entries for the flushed position.
    pub fn flush(&self, msg: &Message) {
        for (i, port) in self.ports.iter().enumerate() {
            if !port.via_repeater {
                continue;
            }
            let at_data_layer = port
                .query
                .layer
                .as_deref()
                .is_some_and(|layer| msg.store.layer_name() == layer);
            if !at_data_layer {
                continue;
            }
            let promised = msg
                .store
                .flush_counts()
                .and_then(|counts| {
                    let principal = self.principal_layer.lock();
                    principal
                        .as_deref()
                        .and_then(|layer| counts.count_for_name(layer))
                })
                .unwrap_or(0);
            self.repeaters[&i].flush(msg.store.index().hash(), promised);
        }
    }

    /// Joins still waiting plus repeater entries still live. Reported at
    /// shutdown.
    pub fn residual(&self) -> usize {
        let pending = self.pending.lock().len();
        let repeaters: usize = self.repeaters.values().map(Repeater::residual).sum();
        pending + repeaters
    }
}
