//! Error Taxonomy
//!
//! Two families, mirroring when a failure can occur:
//!
//! - [`ConfigurationError`]: raised while the graph is being declared or
//!   wired, before any data flows. A run either starts clean or not at all.
//!
//! - [`RuntimeError`]: raised while messages are in flight. All runtime
//!   errors are fatal; the first one aborts the run with the originating
//!   node name and the triggering index. Nothing is retried or recovered
//!   locally.
//!
//! Residual caches discovered at shutdown are diagnostics (`tracing`
//! warnings), not errors: they indicate a likely wiring or flush-accounting
//! bug without corrupting results already produced.

use thiserror::Error;

/// A graph-construction-time failure. Detected exhaustively by
/// `GraphBuilder::build` before execution begins.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("node name may not be empty")]
    EmptyName,

    #[error("a node named `{0}` is already registered")]
    DuplicateNode(String),

    #[error("no producer found for input `{query}` of node `{node}`")]
    NoProducer { node: String, query: String },

    #[error("ambiguous producers for input `{query}` of node `{node}`: {candidates:?}")]
    AmbiguousProducer {
        node: String,
        query: String,
        candidates: Vec<String>,
    },

    #[error(
        "input `{query}` of node `{node}` expects `{expected}` but producer \
         `{producer}` supplies `{actual}`"
    )]
    TypeConflict {
        node: String,
        query: String,
        producer: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("node `{node}` declares {declared} inputs but its algorithm takes {arity}")]
    ArityMismatch {
        node: String,
        declared: usize,
        arity: usize,
    },

    #[error("node `{node}` is gated on unknown predicate `{predicate}`")]
    UnknownPredicate { node: String, predicate: String },

    #[error("node `{node}` of kind {kind} does not support predicate gating")]
    UnsupportedGate { node: String, kind: &'static str },

    #[error(
        "fold `{node}` cannot determine its contribution layer; qualify its \
         input with `@layer` or consume an unfold output"
    )]
    FoldLayerUnknown { node: String },

    #[error("no driving source was registered")]
    NoSource,

    #[error("configuration key `{key}`: {reason}")]
    Config { key: String, reason: String },
}

/// A failure during execution. Fatal to the whole run.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("product `{name}` could not be resolved at {index}")]
    UnresolvedProduct { name: String, index: String },

    #[error("product `{name}` at {index} holds `{actual}` but `{requested}` was requested")]
    TypeMismatch {
        name: String,
        index: String,
        actual: &'static str,
        requested: &'static str,
    },

    #[error("algorithm `{node}` failed at {index}: {message}")]
    Algorithm {
        node: String,
        index: String,
        message: String,
    },
}

/// Top-level error type returned by graph construction and execution.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("executor failure: {0}")]
    Executor(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_pieces() {
        let err = ConfigurationError::NoProducer {
            node: "tracker".into(),
            query: "hits".into(),
        };
        let text = err.to_string();
        assert!(text.contains("tracker"));
        assert!(text.contains("hits"));

        let err = RuntimeError::TypeMismatch {
            name: "energy".into(),
            index: "/job:0/run:1".into(),
            actual: "f64",
            requested: "i64",
        };
        let text = err.to_string();
        assert!(text.contains("/job:0/run:1"));
        assert!(text.contains("f64"));
        assert!(text.contains("i64"));
    }
}
