//! Lowering-engine behavior against a recording builder stub.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use npu_lower::attr::AttrMap;
use npu_lower::builder::{
    ConstantValue, CustomOpIdentifier, ProgramBuilder, TensorId, TensorInfo,
};
use npu_lower::compiler::{CompileError, Compiler};
use npu_lower::device::BackendError;
use npu_lower::dtype::DType;
use npu_lower::ir::Graph;
use npu_lower::storage::{HostBuffer, InMemoryStorage};
use npu_lower::strategy::Strategy;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Input(String),
    Weight(String),
    Output(TensorId),
    Emit {
        op: String,
        inputs: Vec<TensorId>,
        attrs: Vec<String>,
        outputs: Vec<TensorId>,
    },
    EmitCustom {
        target: String,
        domain: String,
        version: i64,
        attrs: Vec<String>,
    },
    Constant {
        dtype: DType,
        len: usize,
        dims: Vec<i64>,
    },
    VirtualGraph(Vec<TensorId>, i64),
    PipelineStage(Vec<TensorId>, i64),
    MemoryProportion(Vec<TensorId>, f32),
    Serialize(Vec<TensorId>, String, i64),
}

type EventLog = Rc<RefCell<Vec<Event>>>;

/// Builder stub that logs every call. Inputs and weights keep their names as
/// ids, op results get `t{n}`, constants `c{n}`, matching the model runtime.
struct RecordingBuilder {
    events: EventLog,
    next_tensor: usize,
    next_const: usize,
    /// When set, `emit` drops one result id to provoke arity checking.
    short_outputs: bool,
}

impl RecordingBuilder {
    fn new(events: EventLog) -> Self {
        Self {
            events,
            next_tensor: 0,
            next_const: 0,
            short_outputs: false,
        }
    }

    fn mint(&mut self) -> TensorId {
        let id = format!("t{}", self.next_tensor);
        self.next_tensor += 1;
        id
    }
}

impl ProgramBuilder for RecordingBuilder {
    fn add_input(&mut self, _info: &TensorInfo, name: &str) -> Result<TensorId, BackendError> {
        self.events.borrow_mut().push(Event::Input(name.to_string()));
        Ok(name.to_string())
    }

    fn add_initialized_input(
        &mut self,
        _data: &HostBuffer,
        name: &str,
    ) -> Result<TensorId, BackendError> {
        self.events
            .borrow_mut()
            .push(Event::Weight(name.to_string()));
        Ok(name.to_string())
    }

    fn add_output(&mut self, id: &TensorId) -> Result<(), BackendError> {
        self.events.borrow_mut().push(Event::Output(id.clone()));
        Ok(())
    }

    fn emit(
        &mut self,
        op: &str,
        inputs: &[TensorId],
        attrs: &AttrMap,
        num_outputs: usize,
        _debug_id: &str,
    ) -> Result<Vec<TensorId>, BackendError> {
        let produced = if self.short_outputs {
            num_outputs.saturating_sub(1)
        } else {
            num_outputs
        };
        let outputs: Vec<TensorId> = (0..produced).map(|_| self.mint()).collect();
        self.events.borrow_mut().push(Event::Emit {
            op: op.to_string(),
            inputs: inputs.to_vec(),
            attrs: attrs.iter().map(|(name, _)| name.clone()).collect(),
            outputs: outputs.clone(),
        });
        Ok(outputs)
    }

    fn emit_custom(
        &mut self,
        ident: &CustomOpIdentifier,
        _inputs: &[TensorId],
        num_outputs: usize,
        attrs: &AttrMap,
        _debug_id: &str,
    ) -> Result<Vec<TensorId>, BackendError> {
        self.events.borrow_mut().push(Event::EmitCustom {
            target: ident.target_op.clone(),
            domain: ident.domain.clone(),
            version: ident.version,
            attrs: attrs.iter().map(|(name, _)| name.clone()).collect(),
        });
        Ok((0..num_outputs).map(|_| self.mint()).collect())
    }

    fn add_constant(
        &mut self,
        value: &ConstantValue,
        dims: &[i64],
        _debug_id: &str,
    ) -> Result<TensorId, BackendError> {
        self.events.borrow_mut().push(Event::Constant {
            dtype: value.dtype(),
            len: value.len(),
            dims: dims.to_vec(),
        });
        let id = format!("c{}", self.next_const);
        self.next_const += 1;
        Ok(id)
    }

    fn tensor_shape(&self, id: &TensorId) -> Result<Vec<i64>, BackendError> {
        Err(BackendError::execution(format!(
            "shape of `{id}` is unresolved"
        )))
    }

    fn virtual_graph(&mut self, ids: &[TensorId], device_index: i64) -> Result<(), BackendError> {
        self.events
            .borrow_mut()
            .push(Event::VirtualGraph(ids.to_vec(), device_index));
        Ok(())
    }

    fn pipeline_stage(&mut self, ids: &[TensorId], stage: i64) -> Result<(), BackendError> {
        self.events
            .borrow_mut()
            .push(Event::PipelineStage(ids.to_vec(), stage));
        Ok(())
    }

    fn set_available_memory_proportion(
        &mut self,
        ids: &[TensorId],
        proportion: f32,
    ) -> Result<(), BackendError> {
        self.events
            .borrow_mut()
            .push(Event::MemoryProportion(ids.to_vec(), proportion));
        Ok(())
    }

    fn set_serialize_matmul(
        &mut self,
        ids: &[TensorId],
        mode: &str,
        factor: i64,
    ) -> Result<(), BackendError> {
        self.events
            .borrow_mut()
            .push(Event::Serialize(ids.to_vec(), mode.to_string(), factor));
        Ok(())
    }

    fn convert_floats_to_halfs(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn model_blob(&self) -> Result<Vec<u8>, BackendError> {
        Ok(Vec::new())
    }

    fn save_model(&self, _path: &Path) -> Result<(), BackendError> {
        Ok(())
    }
}

fn compiler_with_log(strategy: Strategy) -> (Compiler, EventLog) {
    let events: EventLog = Rc::new(RefCell::new(Vec::new()));
    let builder = RecordingBuilder::new(Rc::clone(&events));
    (Compiler::new(Box::new(builder), strategy), events)
}

fn relu_graph() -> Graph {
    let mut graph = Graph::new();
    graph.add_var("x", vec![4], DType::F32, false).unwrap();
    graph.add_var("y", vec![4], DType::F32, false).unwrap();
    graph
        .add_frontend_op("npu_relu", AttrMap::new(), &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    graph
}

#[test]
fn four_stages_drive_the_builder_in_order() {
    let (mut compiler, events) = compiler_with_log(Strategy::default());
    let graph = relu_graph();
    let storage = InMemoryStorage::new();

    compiler.init_inputs(&graph, &["x".to_string()]).unwrap();
    compiler.lower_weights(&graph, &storage).unwrap();
    compiler.lower_body(&graph).unwrap();
    compiler.init_outputs(&["y".to_string()]).unwrap();
    let program = compiler.finish().unwrap();

    let events = events.borrow();
    assert_eq!(events[0], Event::Input("x".to_string()));
    assert_eq!(
        events[1],
        Event::Emit {
            op: "npu_relu".to_string(),
            inputs: vec!["x".to_string()],
            attrs: vec![],
            outputs: vec!["t0".to_string()],
        }
    );
    assert_eq!(events[2], Event::Output("t0".to_string()));
    assert_eq!(program.inputs, vec!["x".to_string()]);
    assert_eq!(program.outputs, vec!["t0".to_string()]);
    assert_eq!(program.tensor("y"), Some(&"t0".to_string()));
}

#[test]
fn missing_feed_is_fatal() {
    let (mut compiler, _) = compiler_with_log(Strategy::default());
    let graph = relu_graph();
    assert!(matches!(
        compiler.init_inputs(&graph, &["nope".to_string()]),
        Err(CompileError::FeedNotFound(_))
    ));
}

#[test]
fn missing_fetch_is_fatal() {
    let (mut compiler, _) = compiler_with_log(Strategy::default());
    assert!(matches!(
        compiler.init_outputs(&["nope".to_string()]),
        Err(CompileError::FetchNotFound(_))
    ));
}

#[test]
fn weights_without_host_data_are_skipped() {
    let mut graph = Graph::new();
    graph.add_var("x", vec![2, 3], DType::F32, false).unwrap();
    graph.add_var("w", vec![3, 4], DType::F32, true).unwrap();
    graph.add_var("absent", vec![7], DType::F32, true).unwrap();
    graph.add_var("y", vec![2, 4], DType::F32, false).unwrap();
    graph
        .add_frontend_op(
            "npu_matmul",
            AttrMap::new(),
            &[("X", &["x"]), ("Y", &["w"])],
            &[("Out", &["y"])],
        )
        .unwrap();

    let mut storage = InMemoryStorage::new();
    storage.insert("w", HostBuffer::zeros(DType::F32, vec![3, 4]));

    let (mut compiler, events) = compiler_with_log(Strategy::default());
    compiler.init_inputs(&graph, &["x".to_string()]).unwrap();
    compiler.lower_weights(&graph, &storage).unwrap();
    compiler.lower_body(&graph).unwrap();

    let events = events.borrow();
    assert!(events.contains(&Event::Weight("w".to_string())));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::Weight(name) if name == "absent")));
}

#[test]
fn duplicate_output_name_is_rejected() {
    let mut graph = Graph::new();
    graph.add_var("x", vec![4], DType::F32, false).unwrap();
    graph.add_var("y", vec![4], DType::F32, false).unwrap();
    graph
        .add_frontend_op("npu_relu", AttrMap::new(), &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();
    graph
        .add_frontend_op("npu_tanh", AttrMap::new(), &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();

    let (mut compiler, _) = compiler_with_log(Strategy::default());
    compiler.init_inputs(&graph, &["x".to_string()]).unwrap();
    assert!(matches!(
        compiler.lower_body(&graph),
        Err(CompileError::DuplicateSymbol(name)) if name == "y"
    ));
}

#[test]
fn schema_projection_drops_marker_attrs() {
    let mut graph = Graph::new();
    graph.add_var("x", vec![2, 5], DType::F32, false).unwrap();
    graph.add_var("y", vec![2, 5], DType::F32, false).unwrap();
    let attrs = AttrMap::new()
        .with("axis", -1i64)
        .with("__op_id", "softmax_0");
    graph
        .add_frontend_op("npu_softmax", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();

    let (mut compiler, events) = compiler_with_log(Strategy::default());
    compiler.init_inputs(&graph, &["x".to_string()]).unwrap();
    compiler.lower_body(&graph).unwrap();

    let events = events.borrow();
    let emitted = events
        .iter()
        .find_map(|e| match e {
            Event::Emit { op, attrs, .. } if op == "npu_softmax" => Some(attrs.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(emitted, vec!["axis".to_string()]);
}

#[test]
fn unknown_op_is_not_registered() {
    let mut graph = Graph::new();
    graph.add_var("x", vec![4], DType::F32, false).unwrap();
    graph.add_var("y", vec![4], DType::F32, false).unwrap();
    graph
        .add_frontend_op("npu_bogus", AttrMap::new(), &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();

    let (mut compiler, _) = compiler_with_log(Strategy::default());
    compiler.init_inputs(&graph, &["x".to_string()]).unwrap();
    assert!(matches!(
        compiler.lower_body(&graph),
        Err(CompileError::NotRegistered(name)) if name == "npu_bogus"
    ));
}

#[test]
fn placement_markers_reach_the_builder() {
    let mut graph = Graph::new();
    graph.add_var("x", vec![4], DType::F32, false).unwrap();
    graph.add_var("y", vec![4], DType::F32, false).unwrap();
    let attrs = AttrMap::new()
        .with("__device_index", 1i64)
        .with("__pipeline_stage", 2i64);
    graph
        .add_frontend_op("npu_relu", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();

    let (mut compiler, events) = compiler_with_log(Strategy::default());
    compiler.init_inputs(&graph, &["x".to_string()]).unwrap();
    compiler.lower_body(&graph).unwrap();

    let events = events.borrow();
    assert!(events.contains(&Event::VirtualGraph(vec!["t0".to_string()], 1)));
    assert!(events.contains(&Event::PipelineStage(vec!["t0".to_string()], 2)));
}

#[test]
fn pipeline_stage_without_device_is_ignored() {
    let mut graph = Graph::new();
    graph.add_var("x", vec![4], DType::F32, false).unwrap();
    graph.add_var("y", vec![4], DType::F32, false).unwrap();
    let attrs = AttrMap::new().with("__pipeline_stage", 2i64);
    graph
        .add_frontend_op("npu_relu", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();

    let (mut compiler, events) = compiler_with_log(Strategy::default());
    compiler.init_inputs(&graph, &["x".to_string()]).unwrap();
    compiler.lower_body(&graph).unwrap();

    let events = events.borrow();
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::PipelineStage(..) | Event::VirtualGraph(..))));
}

fn matmul_graph(attrs: AttrMap) -> Graph {
    let mut graph = Graph::new();
    graph.add_var("a", vec![2, 3], DType::F32, false).unwrap();
    graph.add_var("b", vec![3, 4], DType::F32, false).unwrap();
    graph.add_var("y", vec![2, 4], DType::F32, false).unwrap();
    graph
        .add_frontend_op(
            "npu_matmul",
            attrs,
            &[("X", &["a"]), ("Y", &["b"])],
            &[("Out", &["y"])],
        )
        .unwrap();
    graph
}

#[test]
fn matmul_memory_proportion_and_serialization() {
    let strategy = Strategy {
        available_memory_proportion: 0.5,
        ..Strategy::default()
    };
    let graph = matmul_graph(AttrMap::new().with("__serialize_factor", 4i64));
    let (mut compiler, events) = compiler_with_log(strategy);
    compiler
        .init_inputs(&graph, &["a".to_string(), "b".to_string()])
        .unwrap();
    compiler.lower_body(&graph).unwrap();

    let events = events.borrow();
    assert!(events.contains(&Event::MemoryProportion(vec!["t0".to_string()], 0.5)));
    assert!(events.contains(&Event::Serialize(
        vec!["t0".to_string()],
        "output_channels".to_string(),
        4,
    )));
}

#[test]
fn out_of_range_memory_proportion_is_fatal() {
    let strategy = Strategy {
        available_memory_proportion: 1.5,
        ..Strategy::default()
    };
    let graph = matmul_graph(AttrMap::new());
    let (mut compiler, _) = compiler_with_log(strategy);
    compiler
        .init_inputs(&graph, &["a".to_string(), "b".to_string()])
        .unwrap();
    assert!(matches!(
        compiler.lower_body(&graph),
        Err(CompileError::MemoryProportion(_))
    ));
}

#[test]
fn custom_op_emission_strips_markers() {
    let mut graph = Graph::new();
    graph.add_var("x", vec![4], DType::F32, false).unwrap();
    graph.add_var("y", vec![4], DType::F32, false).unwrap();
    let attrs = AttrMap::new()
        .with("__op_type", "my_special_op")
        .with("__op_id", "my_special_op_0")
        .with("__device_index", 0i64)
        .with("gain", 2.0f32);
    graph
        .add_frontend_op("npu_custom_op", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();

    let (mut compiler, events) = compiler_with_log(Strategy::default());
    compiler.set_custom_ops(&[CustomOpIdentifier::new(
        "my_special_op",
        "SpecialOp",
        "custom.ops",
        1,
    )]);
    compiler.init_inputs(&graph, &["x".to_string()]).unwrap();
    compiler.lower_body(&graph).unwrap();

    let events = events.borrow();
    assert!(events.contains(&Event::EmitCustom {
        target: "SpecialOp".to_string(),
        domain: "custom.ops".to_string(),
        version: 1,
        attrs: vec!["gain".to_string()],
    }));
}

#[test]
fn unregistered_custom_op_is_fatal() {
    let mut graph = Graph::new();
    graph.add_var("x", vec![4], DType::F32, false).unwrap();
    graph.add_var("y", vec![4], DType::F32, false).unwrap();
    let attrs = AttrMap::new().with("__op_type", "my_special_op");
    graph
        .add_frontend_op("npu_custom_op", attrs, &[("X", &["x"])], &[("Out", &["y"])])
        .unwrap();

    let (mut compiler, _) = compiler_with_log(Strategy::default());
    compiler.init_inputs(&graph, &["x".to_string()]).unwrap();
    assert!(matches!(
        compiler.lower_body(&graph),
        Err(CompileError::UnknownCustomOp(name)) if name == "my_special_op"
    ));
}

#[test]
fn constants_keep_their_declared_dtype() {
    let mut graph = Graph::new();
    graph.add_var("c", vec![2], DType::F16, false).unwrap();
    let attrs = AttrMap::new()
        .with("dtype", DType::F16.as_tag())
        .with("dims", vec![2i64])
        .with("value", vec![1.5f32, 2.5]);
    graph
        .add_frontend_op("npu_constant", attrs, &[], &[("Out", &["c"])])
        .unwrap();

    let (mut compiler, events) = compiler_with_log(Strategy::default());
    compiler.lower_body(&graph).unwrap();

    let events = events.borrow();
    assert_eq!(
        events[0],
        Event::Constant {
            dtype: DType::F16,
            len: 2,
            dims: vec![2],
        }
    );
}

#[test]
fn bool_constant_tag_is_unsupported() {
    let mut graph = Graph::new();
    graph.add_var("c", vec![1], DType::Bool, false).unwrap();
    let attrs = AttrMap::new()
        .with("dtype", DType::Bool.as_tag())
        .with("dims", vec![1i64])
        .with("value", vec![1i64]);
    graph
        .add_frontend_op("npu_constant", attrs, &[], &[("Out", &["c"])])
        .unwrap();

    let (mut compiler, _) = compiler_with_log(Strategy::default());
    assert!(matches!(
        compiler.lower_body(&graph),
        Err(CompileError::UnsupportedConstant(_))
    ));
}

#[test]
fn short_builder_output_trips_arity_check() {
    let graph = relu_graph();
    let events: EventLog = Rc::new(RefCell::new(Vec::new()));
    let mut builder = RecordingBuilder::new(Rc::clone(&events));
    builder.short_outputs = true;
    let mut compiler = Compiler::new(Box::new(builder), Strategy::default());
    compiler.init_inputs(&graph, &["x".to_string()]).unwrap();
    assert!(matches!(
        compiler.lower_body(&graph),
        Err(CompileError::OutputArity { expected: 1, got: 0, .. })
    ));
}
