//! Graph Construction
//!
//! `GraphBuilder` collects the driving source, its declared products,
//! and every node registration, then `build()` validates the whole
//! assembly at once: names, arities, gating, and one producer per input
//! query. Nothing allocates runtime state until `build()` succeeds, and
//! a built [`Graph`] is guaranteed free of wiring surprises.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::error::{ConfigurationError, Error};
use crate::graph::binding::{
    box_fold, box_observer, box_predicate, box_provider, box_transform, box_unfold,
    BoxedObserver, BoxedPredicate, BoxedProvider, BoxedTransform, BoxedUnfold, FoldFn, FoldOps,
    ObserverFn, PredicateFn, TransformFn, UnfoldInitFn,
};
use crate::graph::edges::{resolve_edges, NodeDecl, ResolvedNode};
use crate::graph::engine::{BuiltNode, Graph};
use crate::graph::nodes::fold::FoldNode;
use crate::graph::nodes::observer::ObserverNode;
use crate::graph::nodes::output::OutputNode;
use crate::graph::nodes::predicate::PredicateNode;
use crate::graph::nodes::provider::ProviderNode;
use crate::graph::nodes::transform::TransformNode;
use crate::graph::nodes::unfold::UnfoldNode;
use crate::graph::nodes::{Node, NodeKind, NodeOptions};
use crate::graph::ports::{InputGroup, OutputSpec, ProductQuery};
use crate::graph::source::{SourceFn, SourceSink};
use crate::model::{CellIndex, ProductMap, TypeTag};
use crate::persist::{Persistence, TracingPersistence};

enum Body {
    Transform(BoxedTransform),
    Predicate(BoxedPredicate),
    Observer(BoxedObserver),
    Fold(FoldOps),
    Unfold(BoxedUnfold),
    Provider(BoxedProvider),
    Output(Arc<dyn Persistence>),
}

struct Registration {
    name: String,
    kind: NodeKind,
    queries: Vec<ProductQuery>,
    input_tags: Vec<Option<TypeTag>>,
    /// Argument count of the bound closure, for the arity check.
    fn_arity: usize,
    outputs: Vec<OutputSpec>,
    options: NodeOptions,
    /// Fold: the partition layer. Provider: the trigger layer.
    partition_layer: Option<String>,
    new_layer: Option<String>,
    body: Body,
}

#[derive(Default)]
pub struct GraphBuilder {
    source: Option<(String, SourceFn)>,
    source_products: Vec<OutputSpec>,
    registrations: Vec<Registration>,
}

fn queries_of<Q: Into<ProductQuery>>(inputs: impl IntoIterator<Item = Q>) -> Vec<ProductQuery> {
    inputs.into_iter().map(Into::into).collect()
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the driving source. The closure runs on its own thread
    /// and yields stores in hierarchy order.
    pub fn source(
        mut self,
        name: impl Into<String>,
        driver: impl FnOnce(SourceSink) + Send + 'static,
    ) -> Self {
        self.source = Some((name.into(), Box::new(driver)));
        self
    }

    /// Declare a product the source publishes, with its type.
    pub fn source_product<T: Send + Sync + 'static>(mut self, name: impl Into<String>) -> Self {
        self.source_products.push(OutputSpec::typed::<T>(name));
        self
    }

    pub fn transform<Args: 'static, F: TransformFn<Args>>(
        mut self,
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<ProductQuery>>,
        f: F,
        output: impl Into<String>,
        options: NodeOptions,
    ) -> Self {
        let output = output.into();
        self.registrations.push(Registration {
            name: name.into(),
            kind: NodeKind::Transform,
            queries: queries_of(inputs),
            input_tags: F::input_tags().into_iter().map(Some).collect(),
            fn_arity: F::ARITY,
            outputs: vec![OutputSpec {
                name: output.clone(),
                tag: Some(F::output_tag()),
            }],
            options,
            partition_layer: None,
            new_layer: None,
            body: Body::Transform(box_transform(f, output)),
        });
        self
    }

    pub fn predicate<Args: 'static, F: PredicateFn<Args>>(
        mut self,
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<ProductQuery>>,
        f: F,
        options: NodeOptions,
    ) -> Self {
        self.registrations.push(Registration {
            name: name.into(),
            kind: NodeKind::Predicate,
            queries: queries_of(inputs),
            input_tags: F::input_tags().into_iter().map(Some).collect(),
            fn_arity: F::ARITY,
            outputs: Vec::new(),
            options,
            partition_layer: None,
            new_layer: None,
            body: Body::Predicate(box_predicate(f)),
        });
        self
    }

    pub fn observe<Args: 'static, F: ObserverFn<Args>>(
        mut self,
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<ProductQuery>>,
        f: F,
        options: NodeOptions,
    ) -> Self {
        self.registrations.push(Registration {
            name: name.into(),
            kind: NodeKind::Observer,
            queries: queries_of(inputs),
            input_tags: F::input_tags().into_iter().map(Some).collect(),
            fn_arity: F::ARITY,
            outputs: Vec::new(),
            options,
            partition_layer: None,
            new_layer: None,
            body: Body::Observer(box_observer(f)),
        });
        self
    }

    /// Register a fold collapsing fine-grained contributions into one
    /// result per `partition_layer` cell.
    #[allow(clippy::too_many_arguments)]
    pub fn fold<Acc, Args: 'static, F>(
        mut self,
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<ProductQuery>>,
        initial: Acc,
        f: F,
        partition_layer: impl Into<String>,
        output: impl Into<String>,
        options: NodeOptions,
    ) -> Self
    where
        Acc: Clone + Send + Sync + 'static,
        F: FoldFn<Acc, Args>,
    {
        let output = output.into();
        self.registrations.push(Registration {
            name: name.into(),
            kind: NodeKind::Fold,
            queries: queries_of(inputs),
            input_tags: F::input_tags().into_iter().map(Some).collect(),
            fn_arity: F::ARITY,
            outputs: vec![OutputSpec {
                name: output.clone(),
                tag: Some(TypeTag::of::<Acc>()),
            }],
            options,
            partition_layer: Some(partition_layer.into()),
            new_layer: None,
            body: Body::Fold(box_fold(initial, f, output)),
        });
        self
    }

    /// Register an unfold expanding each trigger cell into children at
    /// `new_layer`. `outputs` names the products every generated child
    /// carries.
    #[allow(clippy::too_many_arguments)]
    pub fn unfold<Args: 'static, S, I, P, G>(
        mut self,
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<ProductQuery>>,
        init: I,
        keep_going: P,
        generate: G,
        new_layer: impl Into<String>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
        options: NodeOptions,
    ) -> Self
    where
        I: UnfoldInitFn<Args, S>,
        P: Fn(&S) -> bool + Send + Sync + 'static,
        G: Fn(&mut S) -> ProductMap + Send + Sync + 'static,
        S: Send + 'static,
    {
        self.registrations.push(Registration {
            name: name.into(),
            kind: NodeKind::Unfold,
            queries: queries_of(inputs),
            input_tags: I::input_tags().into_iter().map(Some).collect(),
            fn_arity: I::ARITY,
            outputs: outputs.into_iter().map(OutputSpec::untyped).collect(),
            options,
            partition_layer: None,
            new_layer: Some(new_layer.into()),
            body: Body::Unfold(box_unfold(init, keep_going, generate)),
        });
        self
    }

    /// Register a provider conjuring a layer-scoped product from the
    /// cell index alone.
    pub fn provide<R, F>(
        mut self,
        name: impl Into<String>,
        layer: impl Into<String>,
        f: F,
        output: impl Into<String>,
    ) -> Self
    where
        R: Send + Sync + 'static,
        F: Fn(&CellIndex) -> R + Send + Sync + 'static,
    {
        let output = output.into();
        self.registrations.push(Registration {
            name: name.into(),
            kind: NodeKind::Provider,
            queries: Vec::new(),
            input_tags: Vec::new(),
            fn_arity: 0,
            outputs: vec![OutputSpec {
                name: output.clone(),
                tag: Some(TypeTag::of::<R>()),
            }],
            options: NodeOptions::default(),
            partition_layer: Some(layer.into()),
            new_layer: None,
            body: Body::Provider(box_provider(f, output)),
        });
        self
    }

    /// Register an output sink backed by the default logging backend.
    pub fn output<T: Send + Sync + 'static>(
        self,
        name: impl Into<String>,
        query: impl Into<ProductQuery>,
    ) -> Self {
        self.output_to::<T>(name, query, Arc::new(TracingPersistence), NodeOptions::default())
    }

    /// Register an output sink with an explicit persistence backend.
    pub fn output_to<T: Send + Sync + 'static>(
        mut self,
        name: impl Into<String>,
        query: impl Into<ProductQuery>,
        backend: Arc<dyn Persistence>,
        options: NodeOptions,
    ) -> Self {
        self.registrations.push(Registration {
            name: name.into(),
            kind: NodeKind::Output,
            queries: vec![query.into()],
            input_tags: vec![Some(TypeTag::of::<T>())],
            fn_arity: 1,
            outputs: Vec::new(),
            options,
            partition_layer: None,
            new_layer: None,
            body: Body::Output(backend),
        });
        self
    }

    /// Apply a module's registrations. Modules are plain functions over
    /// the builder; see [`crate::registry`].
    pub fn register_module(self, module: impl FnOnce(GraphBuilder) -> GraphBuilder) -> Self {
        module(self)
    }

    pub fn build(self) -> Result<Graph, Error> {
        let (source_name, source_fn) = self.source.ok_or(ConfigurationError::NoSource)?;
        if source_name.is_empty() {
            return Err(ConfigurationError::EmptyName.into());
        }

        let mut seen = FxHashSet::default();
        seen.insert(source_name.clone());
        for reg in &self.registrations {
            if reg.name.is_empty() {
                return Err(ConfigurationError::EmptyName.into());
            }
            if !seen.insert(reg.name.clone()) {
                return Err(ConfigurationError::DuplicateNode(reg.name.clone()).into());
            }
            if reg.kind != NodeKind::Provider && reg.fn_arity != reg.queries.len() {
                return Err(ConfigurationError::ArityMismatch {
                    node: reg.name.clone(),
                    declared: reg.queries.len(),
                    arity: reg.fn_arity,
                }
                .into());
            }
        }

        let decls: Vec<NodeDecl> = self
            .registrations
            .iter()
            .map(|reg| NodeDecl {
                name: reg.name.clone(),
                kind: reg.kind,
                queries: reg.queries.clone(),
                input_tags: reg.input_tags.clone(),
                outputs: reg.outputs.clone(),
                when: reg.options.when.clone(),
                new_layer: reg.new_layer.clone(),
            })
            .collect();
        let mut resolved = resolve_edges(&source_name, &self.source_products, &decls)?;

        let mut nodes = Vec::with_capacity(self.registrations.len());
        for reg in self.registrations {
            let ResolvedNode { ports, fold } = resolved
                .remove(&reg.name)
                .unwrap_or(ResolvedNode {
                    ports: SmallVec::new(),
                    fold: None,
                });
            let name: Arc<str> = Arc::from(reg.name.as_str());
            let input_names: Vec<String> =
                reg.queries.iter().map(|q| q.name.clone()).collect();
            let when = reg.options.when.clone();
            let concurrency = reg.options.concurrency;

            let (node, output, provider_layer): (Arc<dyn Node>, _, _) = match reg.body {
                Body::Transform(body) => (
                    Arc::new(TransformNode::new(
                        Arc::clone(&name),
                        InputGroup::new(ports.clone()),
                        when.clone(),
                        body,
                        input_names,
                        concurrency,
                    )),
                    None,
                    None,
                ),
                Body::Predicate(body) => (
                    Arc::new(PredicateNode::new(
                        Arc::clone(&name),
                        InputGroup::new(ports.clone()),
                        body,
                        input_names,
                        concurrency,
                    )),
                    None,
                    None,
                ),
                Body::Observer(body) => (
                    Arc::new(ObserverNode::new(
                        Arc::clone(&name),
                        InputGroup::new(ports.clone()),
                        when.clone(),
                        body,
                        input_names,
                        concurrency,
                    )),
                    None,
                    None,
                ),
                Body::Fold(ops) => {
                    let wiring = fold.clone().ok_or_else(|| {
                        Error::Configuration(ConfigurationError::FoldLayerUnknown {
                            node: reg.name.clone(),
                        })
                    })?;
                    let partition_layer = reg
                        .partition_layer
                        .clone()
                        .ok_or_else(|| {
                            Error::Configuration(ConfigurationError::FoldLayerUnknown {
                                node: reg.name.clone(),
                            })
                        })?;
                    (
                        Arc::new(FoldNode::new(
                            Arc::clone(&name),
                            InputGroup::new(ports.clone()),
                            ops,
                            input_names,
                            partition_layer,
                            wiring.expected_layer,
                            wiring.flush_source,
                        )),
                        None,
                        None,
                    )
                }
                Body::Unfold(driver) => (
                    Arc::new(UnfoldNode::new(
                        Arc::clone(&name),
                        InputGroup::new(ports.clone()),
                        when.clone(),
                        driver,
                        input_names,
                        reg.new_layer.clone().unwrap_or_default(),
                        concurrency,
                    )),
                    None,
                    None,
                ),
                Body::Provider(body) => {
                    let layer = reg.partition_layer.clone().unwrap_or_default();
                    (
                        Arc::new(ProviderNode::new(
                            Arc::clone(&name),
                            layer.clone(),
                            body,
                        )),
                        None,
                        Some(layer),
                    )
                }
                Body::Output(backend) => {
                    let product = reg.queries[0].name.clone();
                    let producer = ports[0].producer.clone();
                    (
                        Arc::new(OutputNode::new(
                            Arc::clone(&name),
                            product.clone(),
                            producer.clone(),
                            backend,
                            when.clone(),
                        )),
                        Some((product, producer)),
                        None,
                    )
                }
            };

            nodes.push(BuiltNode {
                name,
                kind: reg.kind,
                node,
                ports,
                output,
                provider_layer,
                when,
            });
        }

        Ok(Graph {
            source_name,
            source_fn,
            nodes,
        })
    }
}
