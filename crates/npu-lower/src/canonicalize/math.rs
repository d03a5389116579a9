//! Handlers for arithmetic and reduction operators.

use crate::attr::AttrMap;
use crate::dtype::DType;
use crate::ir::{Graph, NodeId};

use super::builder::{
    const_attrs_f32, create_base_op, create_cast, create_const, create_gemm,
};
use super::{CanonError, HandlerRegistry};

fn reduce_mean(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let mut attrs = AttrMap::new();
    let reduce_all = op.attrs.get_bool("reduce_all")?;
    if !reduce_all {
        attrs.insert("axes", op.attrs.get_ints("dim")?);
    }
    let keepdims = i64::from(op.attrs.get_bool("keep_dim")?);
    attrs.insert("keepdims", keepdims);
    create_base_op(graph, node, "npu_reducemean", &op.inputs, &op.outputs, attrs)
}

fn mean(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let input = graph.slot_input(node, "X")?;
    let output = graph.slot_output(node, "Out")?;
    let attrs = AttrMap::new().with("keepdims", 0i64);
    create_base_op(graph, node, "npu_reducemean", &[input], &[output], attrs)
}

// pow -> constant(factor) feeding npu_pow
fn pow(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let factor = graph.op(node)?.attrs.get_float("factor")?;
    let outputs = graph.op(node)?.outputs.clone();
    let input = graph.slot_input(node, "X")?;
    let factor_const = create_const(graph, node, const_attrs_f32(&[factor], &[1]))?;
    let factor_out = graph.op_output(factor_const, 0)?;
    create_base_op(
        graph,
        node,
        "npu_pow",
        &[input, factor_out],
        &outputs,
        AttrMap::new(),
    )
}

fn mul(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let x_num_col_dims = op.attrs.get_int("x_num_col_dims")?;
    let y_num_col_dims = op.attrs.get_int("y_num_col_dims")?;
    if x_num_col_dims != 1 || y_num_col_dims != 1 {
        return Err(CanonError::unsupported(
            "mul",
            "x_num_col_dims or y_num_col_dims != 1",
        ));
    }
    let x = graph.slot_input(node, "X")?;
    let y = graph.slot_input(node, "Y")?;
    create_base_op(graph, node, "npu_matmul", &[x, y], &op.outputs, AttrMap::new())
}

fn matmul(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let transpose_x = op.attrs.get_bool("transpose_X")?;
    let transpose_y = op.attrs.get_bool("transpose_Y")?;
    let alpha = op.attrs.get_float("alpha")?;
    create_gemm(
        graph,
        node,
        &op.inputs,
        &op.outputs,
        transpose_x,
        transpose_y,
        alpha,
    )
}

fn sum(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    create_base_op(graph, node, "npu_sum", &op.inputs, &op.outputs, AttrMap::new())
}

fn softmax(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let axis = op.attrs.get_int("axis")?;
    let attrs = AttrMap::new().with("axis", axis);
    create_base_op(graph, node, "npu_softmax", &op.inputs, &op.outputs, attrs)
}

// scale(x) = scale * x + bias, computed in f32 and cast back to the input
// dtype. The no-op case short-circuits to an identity.
fn scale(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let scale = op.attrs.get_float("scale")?;
    let bias = op.attrs.get_float("bias")?;
    let bias_after_scale = op.attrs.get_bool("bias_after_scale")?;
    let input = graph.slot_input(node, "X")?;
    let input_dtype = graph.var(input)?.dtype;

    if (scale - 1.0).abs() < 1e-6 && bias.abs() < 1e-6 {
        return create_base_op(
            graph,
            node,
            "npu_identity",
            &[input],
            &op.outputs,
            AttrMap::new(),
        );
    }

    let bias_const = create_const(graph, node, const_attrs_f32(&[bias], &[1]))?;
    let bias_out = graph.op_output(bias_const, 0)?;
    let scale_const = create_const(graph, node, const_attrs_f32(&[scale], &[1]))?;
    let scale_out = graph.op_output(scale_const, 0)?;
    let cast = create_cast(graph, node, input, &[], DType::F32)?;
    let cast_out = graph.op_output(cast, 0)?;

    let result = if bias_after_scale {
        let mul = create_base_op(
            graph,
            node,
            "npu_mul",
            &[cast_out, scale_out],
            &[],
            AttrMap::new(),
        )?;
        let mul_out = graph.op_output(mul, 0)?;
        create_base_op(
            graph,
            node,
            "npu_add",
            &[mul_out, bias_out],
            &[],
            AttrMap::new(),
        )?
    } else {
        let add = create_base_op(
            graph,
            node,
            "npu_add",
            &[cast_out, bias_out],
            &[],
            AttrMap::new(),
        )?;
        let add_out = graph.op_output(add, 0)?;
        create_base_op(
            graph,
            node,
            "npu_mul",
            &[add_out, scale_out],
            &[],
            AttrMap::new(),
        )?
    };
    let result_out = graph.op_output(result, 0)?;
    create_cast(graph, node, result_out, &op.outputs, input_dtype)
}

// cross_entropy2 -> label cast to i32 feeding npu_nllloss
fn cross_entropy2(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let ignore_index = graph.op(node)?.attrs.get_int("ignore_index")?;
    let x = graph.slot_input(node, "X")?;
    let label = graph.slot_input(node, "Label")?;
    let output = graph.slot_output(node, "Y")?;
    let cast = create_cast(graph, node, label, &[], DType::I32)?;
    let cast_out = graph.op_output(cast, 0)?;
    let attrs = AttrMap::new().with("ignoreIndex", ignore_index);
    create_base_op(graph, node, "npu_nllloss", &[x, cast_out], &[output], attrs)
}

fn elementwise_op(graph: &mut Graph, node: NodeId, ty: &str) -> Result<NodeId, CanonError> {
    let x = graph.slot_input(node, "X")?;
    let y = graph.slot_input(node, "Y")?;
    let output = graph.slot_output(node, "Out")?;
    create_base_op(graph, node, ty, &[x, y], &[output], AttrMap::new())
}

fn elementwise_add(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    elementwise_op(graph, node, "npu_add")
}

fn elementwise_sub(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    elementwise_op(graph, node, "npu_sub")
}

fn elementwise_mul(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    elementwise_op(graph, node, "npu_mul")
}

fn elementwise_div(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    elementwise_op(graph, node, "npu_div")
}

fn elementwise_pow(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    elementwise_op(graph, node, "npu_pow")
}

pub(super) fn register(registry: &mut HandlerRegistry) {
    registry.register("reduce_mean", reduce_mean);
    registry.register("mean", mean);
    registry.register("pow", pow);
    registry.register("mul", mul);
    registry.register("matmul", matmul);
    registry.register("sum", sum);
    registry.register("softmax", softmax);
    registry.register("scale", scale);
    registry.register("cross_entropy2", cross_entropy2);
    registry.register("elementwise_add", elementwise_add);
    registry.register("elementwise_sub", elementwise_sub);
    registry.register("elementwise_mul", elementwise_mul);
    registry.register("elementwise_div", elementwise_div);
    registry.register("elementwise_pow", elementwise_pow);
}
