//! Canonicalization: rewrites front-end operators into the normalized
//! `npu_` vocabulary understood by the lowering engine.
//!
//! Each front-end operator type maps to a handler that builds the
//! replacement subgraph in place; the pass driver then erases the original
//! node. Handlers live in per-family modules mirroring the front-end op
//! catalog.

pub mod builder;

mod activation;
mod math;
mod nn;
mod other;
mod tensor;

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::attr::AttrError;
use crate::ir::{Graph, GraphError, NodeId};
use crate::names::NORMALIZED_PREFIX;

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("no handler registered for op `{0}`")]
    NoHandler(String),
    #[error("op `{op}`: {message}")]
    Unsupported { op: String, message: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Attr(#[from] AttrError),
}

impl CanonError {
    pub fn unsupported(op: impl Into<String>, message: impl Into<String>) -> Self {
        CanonError::Unsupported {
            op: op.into(),
            message: message.into(),
        }
    }
}

/// Rewrites one front-end op into normalized form, returning the id of the
/// last op of the replacement subgraph.
pub type SymbolHandler = fn(&mut Graph, NodeId) -> Result<NodeId, CanonError>;

/// Explicit handler table, one entry per front-end operator type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, SymbolHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every built-in handler family.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        activation::register(&mut registry);
        math::register(&mut registry);
        nn::register(&mut registry);
        tensor::register(&mut registry);
        other::register(&mut registry);
        registry
    }

    /// Registers a handler. The first registration wins; a duplicate is
    /// logged and ignored, returning `false`.
    pub fn register(&mut self, symbol: impl Into<String>, handler: SymbolHandler) -> bool {
        let symbol = symbol.into();
        if self.handlers.contains_key(&symbol) {
            log::warn!("handler for operator `{symbol}` registered twice, keeping the first");
            return false;
        }
        self.handlers.insert(symbol, handler);
        true
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolHandler> {
        self.handlers.get(symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Runs the canonicalization pass over every op in the graph.
///
/// Ops already in the normalized vocabulary pass through untouched. Source
/// types named in `custom_ops` route through the custom-op handler instead of
/// the registry. A front-end op with no handler is fatal.
pub fn canonicalize_graph(
    graph: &mut Graph,
    registry: &HandlerRegistry,
    custom_ops: &HashSet<String>,
) -> Result<(), CanonError> {
    for op_id in graph.op_ids() {
        if !graph.contains(op_id) {
            continue;
        }
        let ty = graph.op(op_id)?.ty.clone();
        if ty.starts_with(NORMALIZED_PREFIX) {
            continue;
        }
        log::trace!("canonicalizing op `{ty}`");
        let handler = if custom_ops.contains(&ty) {
            other::custom_op
        } else {
            registry
                .get(&ty)
                .ok_or_else(|| CanonError::NoHandler(ty.clone()))?
        };
        handler(graph, op_id)?;
        if graph.contains(op_id) {
            graph.erase_op(op_id)?;
        }
    }
    Ok(())
}
