//! Handlers for unary activation operators, all 1:1 renames.

use crate::ir::{Graph, NodeId};

use super::builder::create_base_op;
use super::{CanonError, HandlerRegistry};

fn activation_op(graph: &mut Graph, node: NodeId, ty: &str) -> Result<NodeId, CanonError> {
    let input = graph.slot_input(node, "X")?;
    let outputs = graph.op(node)?.outputs.clone();
    create_base_op(graph, node, ty, &[input], &outputs, Default::default())
}

fn relu(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    activation_op(graph, node, "npu_relu")
}

fn tanh(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    activation_op(graph, node, "npu_tanh")
}

fn log(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    activation_op(graph, node, "npu_log")
}

fn sigmoid(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    activation_op(graph, node, "npu_sigmoid")
}

fn sqrt(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    activation_op(graph, node, "npu_sqrt")
}

fn gelu(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    activation_op(graph, node, "npu_gelu")
}

pub(super) fn register(registry: &mut HandlerRegistry) {
    registry.register("relu", relu);
    registry.register("tanh", tanh);
    registry.register("log", log);
    registry.register("sigmoid", sigmoid);
    registry.register("sqrt", sqrt);
    registry.register("gelu", gelu);
}
