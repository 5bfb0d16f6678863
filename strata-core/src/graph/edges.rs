//! Build-Time Edge Resolution
//!
//! Before any data flows, every input query is bound to exactly one
//! producer: the driving source (for declared source products) or a node
//! that lists the product among its outputs. Ambiguity and absence are
//! configuration errors surfaced by `build()`, never at runtime. The
//! same pass decides which ports need a repeater and derives a fold's
//! completion wiring from its upstream producer.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::ConfigurationError;
use crate::graph::nodes::NodeKind;
use crate::graph::ports::{OutputSpec, PortConfig, ProductQuery};
use crate::model::TypeTag;

/// A node as the builder registered it, before wiring.
#[derive(Debug)]
pub(crate) struct NodeDecl {
    pub name: String,
    pub kind: NodeKind,
    pub queries: Vec<ProductQuery>,
    /// Requested type per port, where the binding knows it.
    pub input_tags: Vec<Option<TypeTag>>,
    pub outputs: Vec<OutputSpec>,
    pub when: Vec<String>,
    /// Unfold only: layer the generated children live at.
    pub new_layer: Option<String>,
}

/// The wiring `build()` derives for one node.
#[derive(Debug)]
pub(crate) struct ResolvedNode {
    pub ports: SmallVec<[PortConfig; 4]>,
    pub fold: Option<FoldWiring>,
}

/// How a fold recognizes completion: contributions are counted at
/// `expected_layer`, and only flushes from `flush_source` close
/// partitions.
#[derive(Debug, Clone)]
pub(crate) struct FoldWiring {
    pub expected_layer: String,
    pub flush_source: String,
}

struct Producer<'a> {
    name: &'a str,
    tag: Option<TypeTag>,
    kind: Option<NodeKind>,
}

pub(crate) fn resolve_edges(
    source_name: &str,
    source_products: &[OutputSpec],
    decls: &[NodeDecl],
) -> Result<FxHashMap<String, ResolvedNode>, ConfigurationError> {
    // Product name -> everyone who claims to publish it.
    let mut producers: FxHashMap<&str, Vec<Producer<'_>>> = FxHashMap::default();
    for spec in source_products {
        producers.entry(&spec.name).or_default().push(Producer {
            name: source_name,
            tag: spec.tag,
            kind: None,
        });
    }
    for decl in decls {
        for spec in &decl.outputs {
            producers.entry(&spec.name).or_default().push(Producer {
                name: &decl.name,
                tag: spec.tag,
                kind: Some(decl.kind),
            });
        }
    }

    let predicates: Vec<&str> = decls
        .iter()
        .filter(|d| d.kind == NodeKind::Predicate)
        .map(|d| d.name.as_str())
        .collect();
    let unfold_layers: FxHashMap<&str, &str> = decls
        .iter()
        .filter(|d| d.kind == NodeKind::Unfold)
        .filter_map(|d| d.new_layer.as_deref().map(|l| (d.name.as_str(), l)))
        .collect();

    let mut resolved = FxHashMap::default();
    for decl in decls {
        check_gating(decl, &predicates)?;

        let mut ports: SmallVec<[PortConfig; 4]> = SmallVec::new();
        for (i, query) in decl.queries.iter().enumerate() {
            let producer = pick_producer(decl, query, decl.input_tags.get(i).copied().flatten(), &producers)?;
            ports.push(PortConfig {
                query: query.clone(),
                producer: producer.name.to_string(),
                // Layer-qualified node output feeding a multi-port join:
                // the datum must be replayed for every finer trigger.
                via_repeater: decl.queries.len() > 1
                    && query.layer.is_some()
                    && producer.kind.is_some(),
            });
        }

        let fold = if decl.kind == NodeKind::Fold {
            Some(fold_wiring(decl, &ports, source_name, &unfold_layers)?)
        } else {
            None
        };

        resolved.insert(decl.name.clone(), ResolvedNode { ports, fold });
    }
    Ok(resolved)
}

fn check_gating(decl: &NodeDecl, predicates: &[&str]) -> Result<(), ConfigurationError> {
    if decl.when.is_empty() {
        return Ok(());
    }
    if !matches!(
        decl.kind,
        NodeKind::Transform | NodeKind::Observer | NodeKind::Output | NodeKind::Unfold
    ) {
        return Err(ConfigurationError::UnsupportedGate {
            node: decl.name.clone(),
            kind: decl.kind.as_str(),
        });
    }
    for predicate in &decl.when {
        if !predicates.contains(&predicate.as_str()) {
            return Err(ConfigurationError::UnknownPredicate {
                node: decl.name.clone(),
                predicate: predicate.clone(),
            });
        }
    }
    Ok(())
}

fn pick_producer<'a>(
    decl: &NodeDecl,
    query: &ProductQuery,
    requested: Option<TypeTag>,
    producers: &'a FxHashMap<&str, Vec<Producer<'a>>>,
) -> Result<&'a Producer<'a>, ConfigurationError> {
    let candidates: Vec<&Producer<'_>> = producers
        .get(query.name.as_str())
        .map(|c| {
            c.iter()
                .filter(|p| query.producer.as_deref().map_or(true, |want| p.name == want))
                // A node's own outputs never feed its own inputs.
                .filter(|p| p.name != decl.name)
                .collect()
        })
        .unwrap_or_default();

    match candidates.as_slice() {
        [] => Err(ConfigurationError::NoProducer {
            node: decl.name.clone(),
            query: query.display(),
        }),
        [producer] => {
            if let (Some(requested), Some(declared)) = (requested, producer.tag) {
                if requested != declared {
                    return Err(ConfigurationError::TypeConflict {
                        node: decl.name.clone(),
                        query: query.display(),
                        producer: producer.name.to_string(),
                        expected: requested.name(),
                        actual: declared.name(),
                    });
                }
            }
            Ok(producer)
        }
        many => Err(ConfigurationError::AmbiguousProducer {
            node: decl.name.clone(),
            query: query.display(),
            candidates: many.iter().map(|p| p.name.to_string()).collect(),
        }),
    }
}

fn fold_wiring(
    decl: &NodeDecl,
    ports: &[PortConfig],
    source_name: &str,
    unfold_layers: &FxHashMap<&str, &str>,
) -> Result<FoldWiring, ConfigurationError> {
    let principal = &ports[0];
    let upstream_unfold = unfold_layers.get(principal.producer.as_str());
    let expected_layer = principal
        .query
        .layer
        .clone()
        .or_else(|| upstream_unfold.map(|l| l.to_string()))
        .ok_or_else(|| ConfigurationError::FoldLayerUnknown {
            node: decl.name.clone(),
        })?;
    let flush_source = if upstream_unfold.is_some() {
        principal.producer.clone()
    } else {
        source_name.to_string()
    };
    Ok(FoldWiring {
        expected_layer,
        flush_source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, kind: NodeKind) -> NodeDecl {
        NodeDecl {
            name: name.to_string(),
            kind,
            queries: Vec::new(),
            input_tags: Vec::new(),
            outputs: Vec::new(),
            when: Vec::new(),
            new_layer: None,
        }
    }

    #[test]
    fn unique_producer_wins() {
        let mut tracker = decl("tracker", NodeKind::Transform);
        tracker.queries = vec![ProductQuery::new("hits")];
        tracker.input_tags = vec![Some(TypeTag::of::<Vec<u32>>())];
        tracker.outputs = vec![OutputSpec::typed::<u64>("tracks")];

        let source = vec![OutputSpec::typed::<Vec<u32>>("hits")];
        let resolved = resolve_edges("Source", &source, &[tracker]).unwrap();
        assert_eq!(resolved["tracker"].ports[0].producer, "Source");
        assert!(!resolved["tracker"].ports[0].via_repeater);
    }

    #[test]
    fn missing_and_ambiguous_producers_fail_the_build() {
        let mut orphan = decl("orphan", NodeKind::Observer);
        orphan.queries = vec![ProductQuery::new("ghost")];
        orphan.input_tags = vec![None];
        let err = resolve_edges("Source", &[], &[orphan]).unwrap_err();
        assert!(matches!(err, ConfigurationError::NoProducer { .. }));

        let mut a = decl("a", NodeKind::Transform);
        a.outputs = vec![OutputSpec::typed::<u32>("tracks")];
        let mut b = decl("b", NodeKind::Transform);
        b.outputs = vec![OutputSpec::typed::<u32>("tracks")];
        let mut sink = decl("sink", NodeKind::Observer);
        sink.queries = vec![ProductQuery::new("tracks")];
        sink.input_tags = vec![None];
        let err = resolve_edges("Source", &[], &[a, b, sink]).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::AmbiguousProducer { ref candidates, .. } if candidates.len() == 2
        ));
    }

    #[test]
    fn producer_qualifier_disambiguates() {
        let mut a = decl("a", NodeKind::Transform);
        a.outputs = vec![OutputSpec::typed::<u32>("tracks")];
        let mut b = decl("b", NodeKind::Transform);
        b.outputs = vec![OutputSpec::typed::<u32>("tracks")];
        let mut sink = decl("sink", NodeKind::Observer);
        sink.queries = vec![ProductQuery::new("tracks").from("b")];
        sink.input_tags = vec![Some(TypeTag::of::<u32>())];
        let resolved = resolve_edges("Source", &[], &[a, b, sink]).unwrap();
        assert_eq!(resolved["sink"].ports[0].producer, "b");
    }

    #[test]
    fn type_disagreement_is_a_conflict() {
        let mut sink = decl("sink", NodeKind::Observer);
        sink.queries = vec![ProductQuery::new("hits")];
        sink.input_tags = vec![Some(TypeTag::of::<String>())];
        let source = vec![OutputSpec::typed::<Vec<u32>>("hits")];
        let err = resolve_edges("Source", &source, &[sink]).unwrap_err();
        assert!(matches!(err, ConfigurationError::TypeConflict { .. }));
    }

    #[test]
    fn gating_rules() {
        let mut gated_fold = decl("sum", NodeKind::Fold);
        gated_fold.queries = vec![ProductQuery::new("hits").at_layer("event")];
        gated_fold.input_tags = vec![None];
        gated_fold.when = vec!["keep".into()];
        let source = vec![OutputSpec::typed::<u32>("hits")];
        let err = resolve_edges("Source", &source, &[gated_fold]).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnsupportedGate { .. }));

        let mut gated = decl("watch", NodeKind::Observer);
        gated.queries = vec![ProductQuery::new("hits")];
        gated.input_tags = vec![None];
        gated.when = vec!["keep".into()];
        let err = resolve_edges("Source", &source, &[gated]).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownPredicate { .. }));
    }

    #[test]
    fn fold_wiring_follows_the_upstream_unfold() {
        let mut splitter = decl("splitter", NodeKind::Unfold);
        splitter.queries = vec![ProductQuery::new("wave")];
        splitter.input_tags = vec![None];
        splitter.outputs = vec![OutputSpec::untyped("sample")];
        splitter.new_layer = Some("sample".into());

        let mut sum = decl("sum", NodeKind::Fold);
        sum.queries = vec![ProductQuery::new("sample")];
        sum.input_tags = vec![None];

        let source = vec![OutputSpec::typed::<Vec<u8>>("wave")];
        let resolved = resolve_edges("Source", &source, &[splitter, sum]).unwrap();
        let wiring = resolved["sum"].fold.as_ref().unwrap();
        assert_eq!(wiring.expected_layer, "sample");
        assert_eq!(wiring.flush_source, "splitter");
    }

    #[test]
    fn coarser_node_fed_port_uses_a_repeater() {
        let mut calib = decl("calib", NodeKind::Transform);
        calib.queries = vec![ProductQuery::new("raw").at_layer("run")];
        calib.input_tags = vec![None];
        calib.outputs = vec![OutputSpec::typed::<f64>("geometry")];

        let mut fitter = decl("fitter", NodeKind::Transform);
        fitter.queries = vec![
            ProductQuery::new("hits"),
            ProductQuery::new("geometry").at_layer("run"),
        ];
        fitter.input_tags = vec![None, Some(TypeTag::of::<f64>())];
        fitter.outputs = vec![OutputSpec::typed::<u64>("tracks")];

        let source = vec![
            OutputSpec::typed::<Vec<u32>>("hits"),
            OutputSpec::typed::<Vec<u32>>("raw"),
        ];
        let resolved = resolve_edges("Source", &source, &[calib, fitter]).unwrap();
        let ports = &resolved["fitter"].ports;
        assert!(!ports[0].via_repeater);
        assert!(ports[1].via_repeater);
        assert_eq!(ports[1].producer, "calib");
    }
}
