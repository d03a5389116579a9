//! Handlers for tensor shaping, indexing and creation operators.

use crate::attr::{AttrMap, AttrValue};
use crate::dtype::DType;
use crate::ir::{Graph, NodeId};

use super::builder::{
    const_attrs_f32_splat, const_attrs_i32, const_attrs_i64, create_base_op, create_cast,
    create_const,
};
use super::{CanonError, HandlerRegistry};

fn fill_constant(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    if graph.has_slot_input(node, "ShapeTensor") {
        return Err(CanonError::unsupported(
            "fill_constant",
            "ShapeTensor input",
        ));
    }
    let dtype = DType::from_tag(op.attrs.get_int("dtype")?)
        .ok_or_else(|| CanonError::unsupported("fill_constant", "unknown dtype tag"))?;
    let dims = op.attrs.get_ints("shape")?;
    let value = op.attrs.get_float("value")?;
    let size = dims.iter().product::<i64>().max(0) as usize;
    let value_attr = match dtype {
        DType::F32 => AttrValue::Floats(vec![value; size]),
        DType::F64 => AttrValue::Doubles(vec![value as f64; size]),
        DType::I32 => AttrValue::Int32s(vec![value as i32; size]),
        DType::I64 => AttrValue::Ints(vec![value as i64; size]),
        other => {
            return Err(CanonError::unsupported(
                "fill_constant",
                format!("dtype {other}"),
            ))
        }
    };
    let attrs = AttrMap::new()
        .with("value", value_attr)
        .with("dims", dims)
        .with("dtype", dtype.as_tag());
    let outputs = op.outputs.clone();
    let op_id = create_base_op(graph, node, "npu_constant", &[], &outputs, attrs)?;
    Ok(op_id)
}

fn random_op(
    graph: &mut Graph,
    node: NodeId,
    ty: &str,
    attr_pairs: &[(&str, &str)],
) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let mut attrs = AttrMap::new()
        .with("shape", op.attrs.get_ints("shape")?)
        .with(
            "dtype",
            DType::from_tag(op.attrs.get_int("dtype")?)
                .ok_or_else(|| CanonError::unsupported(ty, "unknown dtype tag"))?
                .as_tag(),
        )
        .with("seed", op.attrs.get_int("seed")? as f32);
    for (target, source) in attr_pairs {
        attrs.insert(*target, op.attrs.get_float(source)?);
    }
    create_base_op(graph, node, ty, &op.inputs, &op.outputs, attrs)
}

fn gaussian_random(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    random_op(
        graph,
        node,
        "npu_randomnormal",
        &[("mean", "mean"), ("scale", "std")],
    )
}

fn uniform_random(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    random_op(
        graph,
        node,
        "npu_randomuniform",
        &[("high", "max"), ("low", "min")],
    )
}

fn transpose(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let perm = op.attrs.get_ints("axis")?;
    let output = graph.slot_output(node, "Out")?;
    let attrs = AttrMap::new().with("perm", perm);
    create_base_op(graph, node, "npu_transpose", &op.inputs, &[output], attrs)
}

fn reshape(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let shape = graph.op(node)?.attrs.get_ints("shape")?;
    let input = graph.slot_input(node, "X")?;
    let output = graph.slot_output(node, "Out")?;
    let shape_const = create_const(
        graph,
        node,
        const_attrs_i64(&shape, &[shape.len() as i64]),
    )?;
    let shape_out = graph.op_output(shape_const, 0)?;
    create_base_op(
        graph,
        node,
        "npu_reshape",
        &[input, shape_out],
        &[output],
        AttrMap::new(),
    )
}

fn gather(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let x = graph.slot_input(node, "X")?;
    let index = graph.slot_input(node, "Index")?;
    let output = graph.slot_output(node, "Out")?;
    create_base_op(
        graph,
        node,
        "npu_gather",
        &[x, index],
        &[output],
        AttrMap::new(),
    )
}

// Empty axes defaults to every 1-sized dim of the input.
fn squeeze(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let mut axes = graph.op(node)?.attrs.get_ints("axes")?;
    let input = graph.slot_input(node, "X")?;
    let output = graph.slot_output(node, "Out")?;
    if axes.is_empty() {
        let input_shape = graph.var(input)?.shape.clone();
        for (i, dim) in input_shape.iter().enumerate() {
            if *dim == 1 {
                axes.push(i as i64);
            }
        }
    }
    let attrs = AttrMap::new().with("axes", axes);
    create_base_op(graph, node, "npu_squeeze", &[input], &[output], attrs)
}

fn cast(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let to = DType::from_tag(op.attrs.get_int("out_dtype")?)
        .ok_or_else(|| CanonError::unsupported("cast", "unknown dtype tag"))?;
    let input = graph.slot_input(node, "X")?;
    create_cast(graph, node, input, &op.outputs, to)
}

// lookup_table squeezes the trailing ids axis and gathers rows. An in-range
// padding_idx rebuilds the table so the padding row reads zeros: the table is
// split around padding_idx and re-concatenated with a zero row. The slice on
// the empty side is dropped when padding sits at either end.
fn lookup_table(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let padding_idx = graph.op(node)?.attrs.get_int("padding_idx")?;
    let w = graph.slot_input(node, "W")?;
    let ids = graph.slot_input(node, "Ids")?;
    let output = graph.slot_output(node, "Out")?;
    let w_shape = graph.var(w)?.shape.clone();
    if w_shape.len() != 2 {
        return Err(CanonError::unsupported(
            "lookup_table",
            format!("table must be 2-D, found rank {}", w_shape.len()),
        ));
    }
    let table_size = w_shape[0];
    let emb_size = w_shape[1];

    let w_node = if padding_idx >= 0 && padding_idx < table_size {
        let zero_row = create_const(
            graph,
            node,
            const_attrs_f32_splat(0.0, &[1, emb_size]),
        )?;
        let zero_row = graph.op_output(zero_row, 0)?;
        let axes = create_const(graph, node, const_attrs_i64(&[0], &[1]))?;
        let axes = graph.op_output(axes, 0)?;
        let step = create_const(graph, node, const_attrs_i64(&[1], &[1]))?;
        let step = graph.op_output(step, 0)?;

        let concat_inputs: Vec<NodeId> = if padding_idx == 0 {
            let right = slice_table(graph, node, w, padding_idx + 1, table_size, axes, step)?;
            vec![zero_row, right]
        } else if padding_idx == table_size - 1 {
            let left = slice_table(graph, node, w, 0, padding_idx, axes, step)?;
            vec![left, zero_row]
        } else {
            let left = slice_table(graph, node, w, 0, padding_idx, axes, step)?;
            let right = slice_table(graph, node, w, padding_idx + 1, table_size, axes, step)?;
            vec![left, zero_row, right]
        };
        let concat = create_base_op(
            graph,
            node,
            "npu_concat",
            &concat_inputs,
            &[],
            AttrMap::new().with("axis", 0i64),
        )?;
        graph.op_output(concat, 0)?
    } else {
        w
    };

    let squeeze = create_base_op(
        graph,
        node,
        "npu_squeeze",
        &[ids],
        &[],
        AttrMap::new().with("axes", vec![-1i64]),
    )?;
    let squeeze_out = graph.op_output(squeeze, 0)?;
    create_base_op(
        graph,
        node,
        "npu_gather",
        &[w_node, squeeze_out],
        &[output],
        AttrMap::new(),
    )
}

fn slice_table(
    graph: &mut Graph,
    node: NodeId,
    table: NodeId,
    start: i64,
    end: i64,
    axes: NodeId,
    step: NodeId,
) -> Result<NodeId, CanonError> {
    let start_const = create_const(graph, node, const_attrs_i64(&[start], &[1]))?;
    let start_out = graph.op_output(start_const, 0)?;
    let end_const = create_const(graph, node, const_attrs_i64(&[end], &[1]))?;
    let end_out = graph.op_output(end_const, 0)?;
    let slice = create_base_op(
        graph,
        node,
        "npu_slice",
        &[table, start_out, end_out, axes, step],
        &[],
        AttrMap::new(),
    )?;
    Ok(graph.op_output(slice, 0)?)
}

fn unsqueeze(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let axes = graph.op(node)?.attrs.get_ints("axes")?;
    let input = graph.slot_input(node, "X")?;
    let output = graph.slot_output(node, "Out")?;
    let attrs = AttrMap::new().with("axes", axes);
    create_base_op(graph, node, "npu_unsqueeze", &[input], &[output], attrs)
}

fn concat(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let axis = op.attrs.get_int("axis")?;
    let attrs = AttrMap::new().with("axis", axis);
    create_base_op(graph, node, "npu_concat", &op.inputs, &op.outputs, attrs)
}

// stack = unsqueeze every input at the stack axis, then concat.
fn stack(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let axis = op.attrs.get_int("axis")?;
    let output = graph.slot_output(node, "Y")?;

    let mut unsqueezed = Vec::with_capacity(op.inputs.len());
    for &input in &op.inputs {
        let unsqueeze = create_base_op(
            graph,
            node,
            "npu_unsqueeze",
            &[input],
            &[],
            AttrMap::new().with("axes", vec![axis]),
        )?;
        unsqueezed.push(graph.op_output(unsqueeze, 0)?);
    }
    create_base_op(
        graph,
        node,
        "npu_concat",
        &unsqueezed,
        &[output],
        AttrMap::new().with("axis", axis),
    )
}

fn shape(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    create_base_op(
        graph,
        node,
        "npu_shape",
        &op.inputs,
        &op.outputs,
        AttrMap::new(),
    )
}

// Tensor-valued bounds win over attrs; axes always come from attrs.
fn slice(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let input = graph.slot_input(node, "Input")?;

    let starts = if graph.has_slot_input(node, "StartsTensor") {
        graph.slot_input(node, "StartsTensor")?
    } else {
        let starts = op.attrs.get_int32s("starts")?;
        let starts_const =
            create_const(graph, node, const_attrs_i32(&starts, &[starts.len() as i64]))?;
        graph.op_output(starts_const, 0)?
    };
    let ends = if graph.has_slot_input(node, "EndsTensor") {
        graph.slot_input(node, "EndsTensor")?
    } else {
        let ends = op.attrs.get_int32s("ends")?;
        let ends_const =
            create_const(graph, node, const_attrs_i32(&ends, &[ends.len() as i64]))?;
        graph.op_output(ends_const, 0)?
    };
    let axes = op.attrs.get_int32s("axes")?;
    let axes_const = create_const(graph, node, const_attrs_i32(&axes, &[axes.len() as i64]))?;
    let axes_out = graph.op_output(axes_const, 0)?;

    create_base_op(
        graph,
        node,
        "npu_slice",
        &[input, starts, ends, axes_out],
        &op.outputs,
        AttrMap::new(),
    )
}

// expand -> npu_tile; repeats come either from the ExpandTimes input (cast
// to i64) or from the expand_times attr.
fn expand(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    if graph.has_slot_input(node, "expand_times_tensor") {
        return Err(CanonError::unsupported("expand", "expand_times_tensor"));
    }

    let repeats = if graph.has_slot_input(node, "ExpandTimes") {
        let times = graph.slot_input(node, "ExpandTimes")?;
        let cast = create_cast(graph, node, times, &[], DType::I64)?;
        graph.op_output(cast, 0)?
    } else {
        let times = op.attrs.get_ints("expand_times")?;
        let times_const =
            create_const(graph, node, const_attrs_i64(&times, &[times.len() as i64]))?;
        graph.op_output(times_const, 0)?
    };
    let input = graph.slot_input(node, "X")?;
    create_base_op(
        graph,
        node,
        "npu_tile",
        &[input, repeats],
        &op.outputs,
        AttrMap::new(),
    )
}

pub(super) fn register(registry: &mut HandlerRegistry) {
    registry.register("fill_constant", fill_constant);
    registry.register("gaussian_random", gaussian_random);
    registry.register("uniform_random", uniform_random);
    registry.register("transpose2", transpose);
    registry.register("reshape2", reshape);
    registry.register("gather", gather);
    registry.register("squeeze2", squeeze);
    registry.register("cast", cast);
    registry.register("lookup_table", lookup_table);
    registry.register("unsqueeze2", unsqueeze);
    registry.register("concat", concat);
    registry.register("stack", stack);
    registry.register("shape", shape);
    registry.register("slice", slice);
    registry.register("expand", expand);
}
