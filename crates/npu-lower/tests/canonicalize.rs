//! Rewrites of front-end operators into the normalized vocabulary.

use std::collections::HashSet;

use npu_lower::attr::{AttrMap, AttrValue};
use npu_lower::canonicalize::{canonicalize_graph, CanonError, HandlerRegistry};
use npu_lower::dtype::DType;
use npu_lower::ir::{Graph, NodeId};

fn registry() -> HandlerRegistry {
    HandlerRegistry::with_builtin_handlers()
}

fn run(graph: &mut Graph) -> Result<(), CanonError> {
    canonicalize_graph(graph, &registry(), &HashSet::new())
}

fn ops_of(graph: &Graph, ty: &str) -> Vec<NodeId> {
    graph
        .op_ids()
        .into_iter()
        .filter(|&id| graph.op(id).map(|o| o.ty == ty).unwrap_or(false))
        .collect()
}

fn add_f32_var(graph: &mut Graph, name: &str, shape: &[i64]) {
    graph
        .add_var(name, shape.to_vec(), DType::F32, false)
        .unwrap();
}

#[test]
fn conv2d_expands_symmetric_pads_and_takes_bias() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[1, 3, 8, 8]);
    add_f32_var(&mut graph, "w", &[4, 3, 3, 3]);
    add_f32_var(&mut graph, "b", &[4]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("dilations", vec![1i64, 1])
        .with("groups", 1i64)
        .with("paddings", vec![1i64, 2])
        .with("strides", vec![1i64, 1]);
    graph
        .add_frontend_op(
            "conv2d",
            attrs,
            &[("Input", &["x"]), ("Filter", &["w"]), ("Bias", &["b"])],
            &[("Output", &["y"])],
        )
        .unwrap();
    run(&mut graph).unwrap();

    let conv = ops_of(&graph, "npu_conv");
    assert_eq!(conv.len(), 1);
    let op = graph.op(conv[0]).unwrap();
    assert_eq!(op.inputs.len(), 3);
    assert_eq!(op.attrs.get_ints("pads").unwrap(), vec![1, 2, 1, 2]);
    assert!(!op.attrs.contains("kernel_shape"));
}

#[test]
fn scale_near_one_collapses_to_identity() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[4]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("scale", 1.0f32)
        .with("bias", 0.0f32)
        .with("bias_after_scale", true);
    graph
        .add_frontend_op("scale", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();

    assert_eq!(ops_of(&graph, "npu_identity").len(), 1);
    assert!(ops_of(&graph, "npu_constant").is_empty());
    assert!(ops_of(&graph, "npu_mul").is_empty());
}

#[test]
fn scale_general_path_computes_in_f32_and_casts_back() {
    let mut graph = Graph::new();
    graph.add_var("x", vec![4], DType::F16, false).unwrap();
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("scale", 2.0f32)
        .with("bias", 0.5f32)
        .with("bias_after_scale", true);
    graph
        .add_frontend_op("scale", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();

    // bias and scale constants, cast in, mul then add, cast back out
    assert_eq!(ops_of(&graph, "npu_constant").len(), 2);
    assert_eq!(ops_of(&graph, "npu_cast").len(), 2);
    assert_eq!(ops_of(&graph, "npu_mul").len(), 1);
    assert_eq!(ops_of(&graph, "npu_add").len(), 1);

    let mul = ops_of(&graph, "npu_mul")[0];
    let add = ops_of(&graph, "npu_add")[0];
    let mul_out = graph.op(mul).unwrap().outputs[0];
    assert!(graph.op(add).unwrap().inputs.contains(&mul_out));
}

#[test]
fn scale_bias_first_adds_before_scaling() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[4]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("scale", 3.0f32)
        .with("bias", 1.0f32)
        .with("bias_after_scale", false);
    graph
        .add_frontend_op("scale", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();

    let add = ops_of(&graph, "npu_add")[0];
    let mul = ops_of(&graph, "npu_mul")[0];
    let add_out = graph.op(add).unwrap().outputs[0];
    assert!(graph.op(mul).unwrap().inputs.contains(&add_out));
}

#[test]
fn reduce_mean_axes_follow_reduce_all() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[2, 3]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("reduce_all", false)
        .with("dim", vec![1i64])
        .with("keep_dim", true);
    graph
        .add_frontend_op("reduce_mean", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();

    let op = graph.op(ops_of(&graph, "npu_reducemean")[0]).unwrap();
    assert_eq!(op.attrs.get_ints("axes").unwrap(), vec![1]);
    assert_eq!(op.attrs.get_int("keepdims").unwrap(), 1);

    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[2, 3]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("reduce_all", true)
        .with("dim", vec![0i64, 1])
        .with("keep_dim", false);
    graph
        .add_frontend_op("reduce_mean", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();

    let op = graph.op(ops_of(&graph, "npu_reducemean")[0]).unwrap();
    assert!(!op.attrs.contains("axes"));
    assert_eq!(op.attrs.get_int("keepdims").unwrap(), 0);
}

#[test]
fn dropout_upscale_is_identity_downgrade_scales() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[4]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("dropout_implementation", "upscale_in_train")
        .with("dropout_prob", 0.25f32);
    graph
        .add_frontend_op("dropout", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();
    assert_eq!(ops_of(&graph, "npu_identity").len(), 1);

    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[4]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("dropout_implementation", "downgrade_in_infer")
        .with("dropout_prob", 0.25f32);
    graph
        .add_frontend_op("dropout", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();
    let consts = ops_of(&graph, "npu_constant");
    assert_eq!(consts.len(), 1);
    let value = graph.op(consts[0]).unwrap().attrs.get_floats("value").unwrap();
    assert_eq!(value, vec![0.75]);
    assert_eq!(ops_of(&graph, "npu_mul").len(), 1);

    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[4]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("dropout_implementation", "bogus")
        .with("dropout_prob", 0.25f32);
    graph
        .add_frontend_op("dropout", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    assert!(matches!(
        run(&mut graph),
        Err(CanonError::Unsupported { .. })
    ));
}

#[test]
fn pool2d_global_and_explicit_paths() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[1, 3, 8, 8]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("pooling_type", "max")
        .with("global_pooling", true);
    graph
        .add_frontend_op("pool2d", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();
    assert_eq!(ops_of(&graph, "npu_globalmaxpool").len(), 1);

    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[1, 3, 8, 8]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("pooling_type", "avg")
        .with("global_pooling", false)
        .with("padding_algorithm", "EXPLICIT")
        .with("ksize", vec![2i64, 2])
        .with("ceil_mode", false)
        .with("paddings", vec![1i64, 1])
        .with("strides", vec![2i64, 2]);
    graph
        .add_frontend_op("pool2d", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();
    let op = graph.op(ops_of(&graph, "npu_averagepool")[0]).unwrap();
    assert_eq!(op.attrs.get_ints("pads").unwrap(), vec![1, 1, 1, 1]);
    assert_eq!(op.attrs.get_int("count_include_pad").unwrap(), 0);

    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[1, 3, 8, 8]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("pooling_type", "avg")
        .with("global_pooling", false)
        .with("padding_algorithm", "SAME")
        .with("ksize", vec![2i64, 2])
        .with("ceil_mode", false)
        .with("paddings", vec![0i64, 0])
        .with("strides", vec![2i64, 2]);
    graph
        .add_frontend_op("pool2d", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    assert!(matches!(
        run(&mut graph),
        Err(CanonError::Unsupported { .. })
    ));
}

#[test]
fn mul_requires_flattened_operands() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[2, 3]);
    add_f32_var(&mut graph, "w", &[3, 4]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("x_num_col_dims", 2i64)
        .with("y_num_col_dims", 1i64);
    graph
        .add_frontend_op(
            "mul",
            attrs,
            &[("X", &["x"]), ("Y", &["w"])],
            &[("Out", &["y"])],
        )
        .unwrap();
    assert!(matches!(
        run(&mut graph),
        Err(CanonError::Unsupported { .. })
    ));
}

#[test]
fn matmul_becomes_gemm_with_flags() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "a", &[2, 3]);
    add_f32_var(&mut graph, "b", &[2, 4]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("transpose_X", true)
        .with("transpose_Y", false)
        .with("alpha", 0.5f32);
    graph
        .add_frontend_op(
            "matmul",
            attrs,
            &[("X", &["a"]), ("Y", &["b"])],
            &[("Out", &["y"])],
        )
        .unwrap();
    run(&mut graph).unwrap();

    let op = graph.op(ops_of(&graph, "npu_gemm")[0]).unwrap();
    assert_eq!(op.attrs.get_int("transA").unwrap(), 1);
    assert_eq!(op.attrs.get_int("transB").unwrap(), 0);
    assert_eq!(op.attrs.get_float("alpha").unwrap(), 0.5);
    assert_eq!(op.attrs.get_float("beta").unwrap(), 1.0);
}

#[test]
fn fill_constant_rejects_shape_tensor_and_types_value() {
    let mut graph = Graph::new();
    graph.add_var("shape", vec![2], DType::I64, false).unwrap();
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("dtype", DType::F32.as_tag())
        .with("shape", vec![2i64, 2])
        .with("value", 1.0f32);
    graph
        .add_frontend_op(
            "fill_constant",
            attrs,
            &[("ShapeTensor", &["shape"])],
            &[("Out", &["y"])],
        )
        .unwrap();
    assert!(matches!(
        run(&mut graph),
        Err(CanonError::Unsupported { .. })
    ));

    let mut graph = Graph::new();
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("dtype", DType::I64.as_tag())
        .with("shape", vec![3i64])
        .with("value", 7.0f32);
    graph
        .add_frontend_op("fill_constant", attrs, &[], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();
    let op = graph.op(ops_of(&graph, "npu_constant")[0]).unwrap();
    assert_eq!(
        op.attrs.get("value"),
        Some(&AttrValue::Ints(vec![7, 7, 7]))
    );
    assert_eq!(op.attrs.get_int("dtype").unwrap(), DType::I64.as_tag());
}

#[test]
fn lookup_table_padding_row_rebuild() {
    // padding in the middle: two slices around a zero row
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "w", &[5, 4]);
    graph
        .add_var("ids", vec![3, 1], DType::I64, false)
        .unwrap();
    add_f32_var(&mut graph, "out", &[]);
    let attrs = AttrMap::new().with("padding_idx", 2i64);
    graph
        .add_frontend_op(
            "lookup_table",
            attrs,
            &[("W", &["w"]), ("Ids", &["ids"])],
            &[("Out", &["out"])],
        )
        .unwrap();
    run(&mut graph).unwrap();
    let concat = ops_of(&graph, "npu_concat");
    assert_eq!(concat.len(), 1);
    assert_eq!(graph.op(concat[0]).unwrap().inputs.len(), 3);
    assert_eq!(ops_of(&graph, "npu_slice").len(), 2);
    assert_eq!(ops_of(&graph, "npu_squeeze").len(), 1);
    assert_eq!(ops_of(&graph, "npu_gather").len(), 1);

    // padding at row zero: single slice after the zero row
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "w", &[5, 4]);
    graph
        .add_var("ids", vec![3, 1], DType::I64, false)
        .unwrap();
    add_f32_var(&mut graph, "out", &[]);
    let attrs = AttrMap::new().with("padding_idx", 0i64);
    graph
        .add_frontend_op(
            "lookup_table",
            attrs,
            &[("W", &["w"]), ("Ids", &["ids"])],
            &[("Out", &["out"])],
        )
        .unwrap();
    run(&mut graph).unwrap();
    assert_eq!(
        graph
            .op(ops_of(&graph, "npu_concat")[0])
            .unwrap()
            .inputs
            .len(),
        2
    );
    assert_eq!(ops_of(&graph, "npu_slice").len(), 1);

    // out-of-range padding: the table is used as-is
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "w", &[5, 4]);
    graph
        .add_var("ids", vec![3, 1], DType::I64, false)
        .unwrap();
    add_f32_var(&mut graph, "out", &[]);
    let attrs = AttrMap::new().with("padding_idx", -1i64);
    graph
        .add_frontend_op(
            "lookup_table",
            attrs,
            &[("W", &["w"]), ("Ids", &["ids"])],
            &[("Out", &["out"])],
        )
        .unwrap();
    run(&mut graph).unwrap();
    assert!(ops_of(&graph, "npu_concat").is_empty());
    assert!(ops_of(&graph, "npu_slice").is_empty());
}

#[test]
fn lookup_table_rejects_a_flat_table() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "w", &[20]);
    graph
        .add_var("ids", vec![3, 1], DType::I64, false)
        .unwrap();
    add_f32_var(&mut graph, "out", &[]);
    let attrs = AttrMap::new().with("padding_idx", 2i64);
    graph
        .add_frontend_op(
            "lookup_table",
            attrs,
            &[("W", &["w"]), ("Ids", &["ids"])],
            &[("Out", &["out"])],
        )
        .unwrap();
    let err = run(&mut graph).unwrap_err();
    assert!(matches!(err, CanonError::Unsupported { .. }));
}

#[test]
fn slice_bounds_from_attrs_become_constants() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[4, 4]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new()
        .with("starts", vec![0i32])
        .with("ends", vec![2i32])
        .with("axes", vec![0i32]);
    graph
        .add_frontend_op("slice", attrs, &[("Input", &["x"])], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();

    let op = graph.op(ops_of(&graph, "npu_slice")[0]).unwrap();
    assert_eq!(op.inputs.len(), 4);
    assert_eq!(ops_of(&graph, "npu_constant").len(), 3);
}

#[test]
fn layer_norm_reshapes_around_single_group() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[2, 3, 4]);
    add_f32_var(&mut graph, "scale", &[12]);
    add_f32_var(&mut graph, "bias", &[12]);
    add_f32_var(&mut graph, "y", &[]);
    add_f32_var(&mut graph, "mean", &[]);
    add_f32_var(&mut graph, "var", &[]);
    let attrs = AttrMap::new()
        .with("begin_norm_axis", 1i64)
        .with("epsilon", 1e-5f32);
    graph
        .add_frontend_op(
            "layer_norm",
            attrs,
            &[("X", &["x"]), ("Scale", &["scale"]), ("Bias", &["bias"])],
            &[("Y", &["y"]), ("Mean", &["mean"]), ("Variance", &["var"])],
        )
        .unwrap();
    run(&mut graph).unwrap();

    assert_eq!(ops_of(&graph, "npu_reshape").len(), 2);
    let gn = graph
        .op(ops_of(&graph, "npu_groupnormalization")[0])
        .unwrap();
    assert_eq!(gn.attrs.get_int("num_groups").unwrap(), 1);

    // collapse is [prod(dims < axis), prod(dims >= axis)]
    let consts = ops_of(&graph, "npu_constant");
    let shapes: Vec<Vec<i64>> = consts
        .iter()
        .map(|&id| graph.op(id).unwrap().attrs.get_ints("value").unwrap())
        .collect();
    assert!(shapes.contains(&vec![2, 12]));
    assert!(shapes.contains(&vec![2, 3, 4]));
}

#[test]
fn stack_unsqueezes_each_input_then_concats() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "a", &[3]);
    add_f32_var(&mut graph, "b", &[3]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new().with("axis", 0i64);
    graph
        .add_frontend_op(
            "stack",
            attrs,
            &[("X", &["a", "b"])],
            &[("Y", &["y"])],
        )
        .unwrap();
    run(&mut graph).unwrap();

    assert_eq!(ops_of(&graph, "npu_unsqueeze").len(), 2);
    let concat = graph.op(ops_of(&graph, "npu_concat")[0]).unwrap();
    assert_eq!(concat.inputs.len(), 2);
    assert_eq!(concat.attrs.get_int("axis").unwrap(), 0);
}

#[test]
fn expand_times_attr_becomes_tile_repeats() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[1, 3]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new().with("expand_times", vec![2i64, 1]);
    graph
        .add_frontend_op("expand", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    run(&mut graph).unwrap();

    let tile = graph.op(ops_of(&graph, "npu_tile")[0]).unwrap();
    assert_eq!(tile.inputs.len(), 2);
    let repeats = graph
        .op(ops_of(&graph, "npu_constant")[0])
        .unwrap()
        .attrs
        .get_ints("value")
        .unwrap();
    assert_eq!(repeats, vec![2, 1]);
}

#[test]
fn cross_entropy_casts_label_and_sets_ignore_index() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[4, 10]);
    graph
        .add_var("label", vec![4], DType::I64, false)
        .unwrap();
    add_f32_var(&mut graph, "loss", &[]);
    let attrs = AttrMap::new().with("ignore_index", -100i64);
    graph
        .add_frontend_op(
            "cross_entropy2",
            attrs,
            &[("X", &["x"]), ("Label", &["label"])],
            &[("Y", &["loss"])],
        )
        .unwrap();
    run(&mut graph).unwrap();

    let cast = graph.op(ops_of(&graph, "npu_cast")[0]).unwrap();
    assert_eq!(cast.attrs.get_int("to").unwrap(), DType::I32.as_tag());
    let nll = graph.op(ops_of(&graph, "npu_nllloss")[0]).unwrap();
    assert_eq!(nll.attrs.get_int("ignoreIndex").unwrap(), -100);
}

#[test]
fn custom_op_routes_past_the_registry() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[4]);
    add_f32_var(&mut graph, "y", &[]);
    let attrs = AttrMap::new().with("gain", 2.0f32);
    graph
        .add_frontend_op("my_special_op", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    let custom: HashSet<String> = ["my_special_op".to_string()].into_iter().collect();
    canonicalize_graph(&mut graph, &registry(), &custom).unwrap();

    let op = graph.op(ops_of(&graph, "npu_custom_op")[0]).unwrap();
    assert_eq!(op.attrs.get_str("__op_type").unwrap(), "my_special_op");
    assert_eq!(op.attrs.get_float("gain").unwrap(), 2.0);
}

#[test]
fn missing_handler_is_fatal() {
    let mut graph = Graph::new();
    add_f32_var(&mut graph, "x", &[4]);
    add_f32_var(&mut graph, "y", &[]);
    graph
        .add_frontend_op("no_such_op", AttrMap::new(), &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    assert!(matches!(run(&mut graph), Err(CanonError::NoHandler(_))));
}

#[test]
fn duplicate_registration_keeps_the_first() {
    let mut registry = HandlerRegistry::new();
    fn handler(_: &mut Graph, node: NodeId) -> Result<NodeId, CanonError> {
        Ok(node)
    }
    assert!(registry.register("foo", handler));
    assert!(!registry.register("foo", handler));
    assert_eq!(registry.len(), 1);
}
