//! The Graph Layer
//!
//! Everything between the model types and the user: message envelopes,
//! join/gating machinery, the seven node kinds, build-time edge
//! resolution, the router, and the execution engine. The public surface
//! is [`GraphBuilder`] in, [`RunSummary`] out.

mod binding;
mod builder;
mod decision;
mod edges;
mod engine;
mod flags;
mod message;
mod multiplexer;
mod nodes;
mod ports;
mod repeater;
mod source;

pub use binding::{
    FoldFn, ObserverFn, PredicateFn, ResolvedInputs, TransformFn, UnfoldInitFn,
};
pub use builder::GraphBuilder;
pub use decision::PredicateResult;
pub use engine::{Graph, RunSummary};
pub use message::{next_message_id, EndOfMessage, Message};
pub use nodes::{Concurrency, NodeKind, NodeOptions, NodeStats};
pub use ports::{OutputSpec, ProductQuery};
pub use source::SourceSink;
