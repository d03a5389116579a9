//! Helpers handlers use to assemble replacement subgraphs.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::attr::{AttrMap, AttrValue};
use crate::dtype::DType;
use crate::ir::{Graph, NodeId};
use crate::names::{
    DEVICE_INDEX_ATTR, GENERATED_PREFIX, OP_IDENT_ATTR, PIPELINE_STAGE_ATTR,
};

use super::CanonError;

static VAR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mints a process-unique variable name.
pub fn generate_var_name() -> String {
    let n = VAR_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{GENERATED_PREFIX}{n}")
}

/// Creates an intermediate variable with a generated name. Shapes of
/// intermediates are left empty; only feed and weight shapes matter to the
/// lowering engine.
pub fn make_var_node(graph: &mut Graph, dtype: DType) -> Result<NodeId, CanonError> {
    Ok(graph.add_var(generate_var_name(), Vec::new(), dtype, false)?)
}

/// Creates an op wired to the given variables. With no outputs, a fresh
/// variable is minted so the result can be chained.
pub fn make_op_node(
    graph: &mut Graph,
    ty: &str,
    inputs: &[NodeId],
    outputs: &[NodeId],
    attrs: AttrMap,
) -> Result<NodeId, CanonError> {
    let op = graph.add_op(ty, attrs);
    for &input in inputs {
        graph.connect_input(op, input)?;
    }
    if outputs.is_empty() {
        let dtype = match inputs.first() {
            Some(&id) => graph.var(id)?.dtype,
            None => DType::F32,
        };
        let var = make_var_node(graph, dtype)?;
        graph.connect_output(op, var)?;
    } else {
        for &output in outputs {
            graph.connect_output(op, output)?;
        }
    }
    Ok(op)
}

/// Like [`make_op_node`], additionally propagating placement attributes from
/// the op being replaced unless the new attrs already set them.
pub fn create_base_op(
    graph: &mut Graph,
    reference: NodeId,
    ty: &str,
    inputs: &[NodeId],
    outputs: &[NodeId],
    mut attrs: AttrMap,
) -> Result<NodeId, CanonError> {
    let reference_attrs = graph.op(reference)?.attrs.clone();
    for key in [DEVICE_INDEX_ATTR, PIPELINE_STAGE_ATTR, OP_IDENT_ATTR] {
        if !attrs.contains(key) {
            if let Some(value) = reference_attrs.get(key) {
                attrs.insert(key, value.clone());
            }
        }
    }
    make_op_node(graph, ty, inputs, outputs, attrs)
}

/// Emits an `npu_constant`. The attrs must carry `value`, `dims` and the
/// `dtype` wire tag; the fresh output variable takes the constant's dtype.
pub fn create_const(
    graph: &mut Graph,
    reference: NodeId,
    attrs: AttrMap,
) -> Result<NodeId, CanonError> {
    let dtype = attrs
        .get_int("dtype")
        .ok()
        .and_then(DType::from_tag)
        .unwrap_or(DType::F32);
    let op = create_base_op(graph, reference, "npu_constant", &[], &[], attrs)?;
    let out = graph.op_output(op, 0)?;
    graph.var_mut(out)?.dtype = dtype;
    Ok(op)
}

/// Emits an `npu_cast` to the requested dtype.
pub fn create_cast(
    graph: &mut Graph,
    reference: NodeId,
    input: NodeId,
    outputs: &[NodeId],
    to: DType,
) -> Result<NodeId, CanonError> {
    let attrs = AttrMap::new().with("to", to.as_tag());
    let op = create_base_op(graph, reference, "npu_cast", &[input], outputs, attrs)?;
    if outputs.is_empty() {
        let out = graph.op_output(op, 0)?;
        graph.var_mut(out)?.dtype = to;
    }
    Ok(op)
}

/// Emits an `npu_gemm` with the usual transpose flags and scaling.
pub fn create_gemm(
    graph: &mut Graph,
    reference: NodeId,
    inputs: &[NodeId],
    outputs: &[NodeId],
    trans_a: bool,
    trans_b: bool,
    alpha: f32,
) -> Result<NodeId, CanonError> {
    let attrs = AttrMap::new()
        .with("alpha", alpha)
        .with("beta", 1.0f32)
        .with("transA", i64::from(trans_a))
        .with("transB", i64::from(trans_b));
    create_base_op(graph, reference, "npu_gemm", inputs, outputs, attrs)
}

/// Emits a constant shape tensor plus an `npu_reshape` of `input` to `shape`.
pub fn create_reshape(
    graph: &mut Graph,
    reference: NodeId,
    input: NodeId,
    outputs: &[NodeId],
    shape: &[i64],
) -> Result<NodeId, CanonError> {
    let shape_const = create_const(
        graph,
        reference,
        const_attrs_i64(shape, &[shape.len() as i64]),
    )?;
    let shape_out = graph.op_output(shape_const, 0)?;
    create_base_op(
        graph,
        reference,
        "npu_reshape",
        &[input, shape_out],
        outputs,
        AttrMap::new(),
    )
}

/// Emits an `npu_conv`. An empty `kernel_shape` is omitted so the backend
/// infers it from the filter tensor.
#[allow(clippy::too_many_arguments)]
pub fn create_conv(
    graph: &mut Graph,
    reference: NodeId,
    inputs: &[NodeId],
    outputs: &[NodeId],
    dilations: &[i64],
    group: i64,
    kernel_shape: &[i64],
    pads: &[i64],
    strides: &[i64],
) -> Result<NodeId, CanonError> {
    let mut attrs = AttrMap::new()
        .with("dilations", dilations.to_vec())
        .with("group", group)
        .with("pads", pads.to_vec())
        .with("strides", strides.to_vec());
    if !kernel_shape.is_empty() {
        attrs.insert("kernel_shape", kernel_shape.to_vec());
    }
    create_base_op(graph, reference, "npu_conv", inputs, outputs, attrs)
}

/// Constant attrs for a float tensor.
pub fn const_attrs_f32(values: &[f32], dims: &[i64]) -> AttrMap {
    AttrMap::new()
        .with("value", values.to_vec())
        .with("dims", dims.to_vec())
        .with("dtype", DType::F32.as_tag())
}

/// Constant attrs for a float tensor filled with one value.
pub fn const_attrs_f32_splat(value: f32, dims: &[i64]) -> AttrMap {
    let size: i64 = dims.iter().product::<i64>().max(0);
    const_attrs_f32(&vec![value; size as usize], dims)
}

pub fn const_attrs_f64(values: &[f64], dims: &[i64]) -> AttrMap {
    AttrMap::new()
        .with("value", values.to_vec())
        .with("dims", dims.to_vec())
        .with("dtype", DType::F64.as_tag())
}

pub fn const_attrs_i32(values: &[i32], dims: &[i64]) -> AttrMap {
    AttrMap::new()
        .with("value", values.to_vec())
        .with("dims", dims.to_vec())
        .with("dtype", DType::I32.as_tag())
}

pub fn const_attrs_i64(values: &[i64], dims: &[i64]) -> AttrMap {
    AttrMap::new()
        .with("value", AttrValue::Ints(values.to_vec()))
        .with("dims", dims.to_vec())
        .with("dtype", DType::I64.as_tag())
}
