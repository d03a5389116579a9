//! Catch-all handlers: user-registered custom ops and debug printing.

use crate::attr::AttrMap;
use crate::ir::{Graph, NodeId};
use crate::names::OP_TYPE_ATTR;

use super::builder::create_base_op;
use super::{CanonError, HandlerRegistry};

/// Wraps a user-registered op: all attrs are carried through and the source
/// type is recorded so the lowering engine can resolve the target op.
pub(super) fn custom_op(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let mut attrs = op.attrs.clone();
    attrs.insert(OP_TYPE_ATTR, op.ty.clone());
    create_base_op(
        graph,
        node,
        "npu_custom_op",
        &op.inputs,
        &op.outputs,
        attrs,
    )
}

fn print(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let title = op.attrs.get_str_or("message", "");
    let attrs = AttrMap::new()
        .with("print_gradient", 1i64)
        .with("title", title);
    create_base_op(
        graph,
        node,
        "npu_printtensor",
        &op.inputs,
        &op.outputs,
        attrs,
    )
}

pub(super) fn register(registry: &mut HandlerRegistry) {
    registry.register("print", print);
}
