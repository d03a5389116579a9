//! Handlers for convolution, pooling, normalization and dropout.

use crate::attr::AttrMap;
use crate::ir::{Graph, NodeId};

use super::builder::{
    const_attrs_f32, create_base_op, create_const, create_conv, create_reshape, make_var_node,
};
use super::{CanonError, HandlerRegistry};

// 2-element paddings are symmetric and expand to [p0, p1, p0, p1].
fn expand_pads(mut pads: Vec<i64>) -> Vec<i64> {
    if pads.len() == 2 {
        pads.push(pads[0]);
        pads.push(pads[1]);
    }
    pads
}

fn conv2d(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let dilations = op.attrs.get_ints("dilations")?;
    let group = op.attrs.get_int("groups")?;
    let pads = expand_pads(op.attrs.get_ints("paddings")?);
    let strides = op.attrs.get_ints("strides")?;

    let input = graph.slot_input(node, "Input")?;
    let filter = graph.slot_input(node, "Filter")?;
    let mut inputs = vec![input, filter];
    if graph.has_slot_input(node, "Bias") {
        inputs.push(graph.slot_input(node, "Bias")?);
    }
    create_conv(
        graph,
        node,
        &inputs,
        &op.outputs,
        &dilations,
        group,
        &[],
        &pads,
        &strides,
    )
}

fn batch_norm(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let inputs = [
        graph.slot_input(node, "X")?,
        graph.slot_input(node, "Scale")?,
        graph.slot_input(node, "Bias")?,
        graph.slot_input(node, "Mean")?,
        graph.slot_input(node, "Variance")?,
    ];
    let outputs = [
        graph.slot_output(node, "Y")?,
        graph.slot_output(node, "MeanOut")?,
        graph.slot_output(node, "VarianceOut")?,
        graph.slot_output(node, "SavedMean")?,
        graph.slot_output(node, "SavedVariance")?,
    ];
    let attrs = AttrMap::new()
        .with("momentum", op.attrs.get_float("momentum")?)
        .with("epsilon", op.attrs.get_float("epsilon")?)
        .with("num_outputs", 1i64);
    create_base_op(
        graph,
        node,
        "npu_batchnormalization",
        &inputs,
        &outputs,
        attrs,
    )
}

fn pool2d(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let pooling_type = op.attrs.get_str("pooling_type")?;
    let global_pooling = op.attrs.get_bool("global_pooling")?;
    if global_pooling {
        let ty = match pooling_type.as_str() {
            "max" => "npu_globalmaxpool",
            "avg" => "npu_globalaveragepool",
            other => {
                return Err(CanonError::unsupported(
                    "pool2d",
                    format!("unknown pooling_type: {other}"),
                ))
            }
        };
        return create_base_op(graph, node, ty, &op.inputs, &op.outputs, AttrMap::new());
    }

    let padding_algorithm = op.attrs.get_str("padding_algorithm")?;
    if padding_algorithm != "EXPLICIT" {
        return Err(CanonError::unsupported(
            "pool2d",
            format!("unknown padding_algorithm: {padding_algorithm}"),
        ));
    }

    let kernel_shape = op.attrs.get_ints("ksize")?;
    let ceil_mode = i64::from(op.attrs.get_bool("ceil_mode")?);
    let pads = expand_pads(op.attrs.get_ints("paddings")?);
    let strides = op.attrs.get_ints("strides")?;
    match pooling_type.as_str() {
        "max" => {
            let attrs = AttrMap::new()
                .with("num_outputs", 1i64)
                .with("kernel_shape", kernel_shape)
                .with("ceil_mode", ceil_mode)
                .with("dilations", Vec::<i64>::new())
                .with("pads", pads)
                .with("storage_order", 0i64)
                .with("strides", strides);
            create_base_op(graph, node, "npu_maxpool", &op.inputs, &op.outputs, attrs)
        }
        "avg" => {
            let attrs = AttrMap::new()
                .with("kernel_shape", kernel_shape)
                .with("ceil_mode", ceil_mode)
                .with("count_include_pad", 0i64)
                .with("pads", pads)
                .with("strides", strides);
            create_base_op(
                graph,
                node,
                "npu_averagepool",
                &op.inputs,
                &op.outputs,
                attrs,
            )
        }
        other => Err(CanonError::unsupported(
            "pool2d",
            format!("unknown pooling_type: {other}"),
        )),
    }
}

fn group_norm(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let attrs = AttrMap::new()
        .with("epsilon", op.attrs.get_float("epsilon")?)
        .with("num_groups", op.attrs.get_int("groups")?);
    let inputs = [
        graph.slot_input(node, "X")?,
        graph.slot_input(node, "Scale")?,
        graph.slot_input(node, "Bias")?,
    ];
    let outputs = [
        graph.slot_output(node, "Y")?,
        graph.slot_output(node, "Mean")?,
        graph.slot_output(node, "Variance")?,
    ];
    create_base_op(
        graph,
        node,
        "npu_groupnormalization",
        &inputs,
        &outputs,
        attrs,
    )
}

fn instance_norm(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let attrs = AttrMap::new().with("epsilon", op.attrs.get_float("epsilon")?);
    let inputs = [
        graph.slot_input(node, "X")?,
        graph.slot_input(node, "Scale")?,
        graph.slot_input(node, "Bias")?,
    ];
    let outputs = [graph.slot_output(node, "Y")?];
    create_base_op(
        graph,
        node,
        "npu_instancenormalization",
        &inputs,
        &outputs,
        attrs,
    )
}

// layer_norm collapses to 2-D around begin_norm_axis, normalizes as a single
// group, and restores the original shape.
fn layer_norm(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let begin_norm_axis = op.attrs.get_int("begin_norm_axis")?;
    let epsilon = op.attrs.get_float("epsilon")?;
    let input = graph.slot_input(node, "X")?;
    let input_shape = graph.var(input)?.shape.clone();

    let mut norm_shape = [1i64, 1i64];
    for (i, dim) in input_shape.iter().enumerate() {
        if (i as i64) < begin_norm_axis {
            norm_shape[0] *= dim;
        } else {
            norm_shape[1] *= dim;
        }
    }

    let reshape_in = create_reshape(graph, node, input, &[], &norm_shape)?;
    let reshape_in_out = graph.op_output(reshape_in, 0)?;

    let input_dtype = graph.var(input)?.dtype;
    let norm_out = make_var_node(graph, input_dtype)?;
    let groupnorm_attrs = AttrMap::new()
        .with("epsilon", epsilon)
        .with("num_groups", 1i64);
    let inputs = [
        reshape_in_out,
        graph.slot_input(node, "Scale")?,
        graph.slot_input(node, "Bias")?,
    ];
    let outputs = [
        norm_out,
        graph.slot_output(node, "Mean")?,
        graph.slot_output(node, "Variance")?,
    ];
    create_base_op(
        graph,
        node,
        "npu_groupnormalization",
        &inputs,
        &outputs,
        groupnorm_attrs,
    )?;

    let final_out = graph.slot_output(node, "Y")?;
    create_reshape(graph, node, norm_out, &[final_out], &input_shape)
}

fn dropout(graph: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
    let op = graph.op(node)?.clone();
    let implementation = op.attrs.get_str("dropout_implementation")?;
    let prob = op.attrs.get_float("dropout_prob")?;
    let input = graph.slot_input(node, "X")?;
    let output = graph.slot_output(node, "Out")?;
    match implementation.as_str() {
        "upscale_in_train" => create_base_op(
            graph,
            node,
            "npu_identity",
            &[input],
            &[output],
            AttrMap::new(),
        ),
        "downgrade_in_infer" => {
            let scale = create_const(graph, node, const_attrs_f32(&[1.0 - prob], &[1]))?;
            let scale_out = graph.op_output(scale, 0)?;
            create_base_op(
                graph,
                node,
                "npu_mul",
                &[input, scale_out],
                &[output],
                AttrMap::new(),
            )
        }
        other => Err(CanonError::unsupported(
            "dropout",
            format!("invalid dropout_implementation: {other}"),
        )),
    }
}

pub(super) fn register(registry: &mut HandlerRegistry) {
    registry.register("pool2d", pool2d);
    registry.register("batch_norm", batch_norm);
    registry.register("group_norm", group_norm);
    registry.register("instance_norm", instance_norm);
    registry.register("layer_norm", layer_norm);
    registry.register("conv2d", conv2d);
    registry.register("dropout", dropout);
}
