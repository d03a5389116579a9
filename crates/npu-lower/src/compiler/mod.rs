//! Lowering engine: drives a [`ProgramBuilder`] from a normalized graph.
//!
//! Lowering runs in four stages over one symbol table mapping front-end
//! variable names to builder tensor ids: declare feeds, declare weights,
//! lower the body in topological order, then mark fetches as outputs.

pub mod schema;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use half::f16;
use log::{debug, warn};
use thiserror::Error;

use crate::attr::{AttrError, AttrMap};
use crate::builder::{ConstantValue, CustomOpIdentifier, ProgramBuilder, TensorId, TensorInfo};
use crate::device::BackendError;
use crate::dtype::DType;
use crate::ir::{Graph, GraphError, NodeId};
use crate::names::{
    DEVICE_INDEX_ATTR, OP_IDENT_ATTR, OP_TYPE_ATTR, PIPELINE_STAGE_ATTR, SERIALIZE_FACTOR_ATTR,
    SERIALIZE_MODE_ATTR, SERIALIZE_MODE_DEFAULT,
};
use crate::strategy::Strategy;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("tensor `{0}` is already in the symbol table")]
    DuplicateSymbol(String),
    #[error("op `{0}` is not in the operator table")]
    NotRegistered(String),
    #[error("feed variable `{0}` is not in the graph")]
    FeedNotFound(String),
    #[error("fetch variable `{0}` was never lowered")]
    FetchNotFound(String),
    #[error("constant has unsupported dtype tag {0}")]
    UnsupportedConstant(i64),
    #[error("custom op `{0}` has no registered identifier")]
    UnknownCustomOp(String),
    #[error("op `{op}` produced {got} tensors, the graph expects {expected}")]
    OutputArity {
        op: String,
        expected: usize,
        got: usize,
    },
    #[error("available memory proportion {0} is out of range")]
    MemoryProportion(f32),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Attr(#[from] AttrError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// The finished artifact of a lowering run.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub blob: Vec<u8>,
    /// Front-end variable name to program tensor id.
    pub tensors: BTreeMap<String, TensorId>,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub weights: Vec<TensorId>,
    /// Shapes the builder could resolve, keyed by tensor id.
    pub shapes: BTreeMap<TensorId, Vec<i64>>,
    pub fp16: bool,
}

impl CompiledProgram {
    pub fn tensor(&self, name: &str) -> Option<&TensorId> {
        self.tensors.get(name)
    }
}

/// Lowers one normalized graph through a runtime's builder.
pub struct Compiler {
    builder: Box<dyn ProgramBuilder>,
    strategy: Strategy,
    tensors: BTreeMap<String, TensorId>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    weights: Vec<TensorId>,
    custom_ops: HashMap<String, CustomOpIdentifier>,
    fp16: bool,
}

impl Compiler {
    pub fn new(builder: Box<dyn ProgramBuilder>, strategy: Strategy) -> Self {
        Self {
            builder,
            strategy,
            tensors: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            weights: Vec::new(),
            custom_ops: HashMap::new(),
            fp16: false,
        }
    }

    /// Registers user operators, keyed by the front-end type they replace.
    pub fn set_custom_ops(&mut self, ops: &[CustomOpIdentifier]) {
        for op in ops {
            self.custom_ops.insert(op.source_op.clone(), op.clone());
        }
    }

    pub fn tensors(&self) -> &BTreeMap<String, TensorId> {
        &self.tensors
    }

    /// Declares each feed as a program input. Feeds must exist in the graph
    /// with their dtype and shape already set.
    pub fn init_inputs(&mut self, graph: &Graph, feed_list: &[String]) -> Result<(), CompileError> {
        for name in feed_list {
            let var_id = graph
                .var_id(name)
                .ok_or_else(|| CompileError::FeedNotFound(name.clone()))?;
            let var = graph.var(var_id)?;
            let info = TensorInfo::new(var.dtype, var.shape.clone());
            let id = self.builder.add_input(&info, name)?;
            debug!("feed {name} -> {id}");
            self.insert_symbol(name.clone(), id.clone())?;
            self.inputs.push(id);
        }
        Ok(())
    }

    /// Declares persistable source variables as initialized weights.
    ///
    /// A persistable variable with no producer that is missing from storage
    /// is skipped; the front end may declare state the session never uses.
    pub fn lower_weights(
        &mut self,
        graph: &Graph,
        storage: &dyn crate::storage::VariableStorage,
    ) -> Result<(), CompileError> {
        for var_id in graph.var_ids() {
            let var = graph.var(var_id)?;
            if !var.persistable || !var.producers.is_empty() || self.tensors.contains_key(&var.name)
            {
                continue;
            }
            let Some(buffer) = storage.find(&var.name) else {
                warn!("persistable variable {} has no host data, skipped", var.name);
                continue;
            };
            let id = self.builder.add_initialized_input(buffer, &var.name)?;
            let name = var.name.clone();
            self.insert_symbol(name, id.clone())?;
            self.weights.push(id);
        }
        Ok(())
    }

    /// Lowers every op in topological order.
    pub fn lower_body(&mut self, graph: &Graph) -> Result<(), CompileError> {
        for op_id in graph.topo_order()? {
            let op = graph.op(op_id)?;
            let inputs = self.gather_inputs(graph, op_id)?;
            let output_names = self.output_names(graph, op_id)?;
            let debug_id = op.attrs.get_str_or(OP_IDENT_ATTR, &op.ty);

            let ids = match op.ty.as_str() {
                "npu_constant" => vec![self.lower_constant(&op.attrs, &debug_id)?],
                "npu_custom_op" => {
                    let source = op.attrs.get_str(OP_TYPE_ATTR)?;
                    let ident = self
                        .custom_ops
                        .get(&source)
                        .ok_or(CompileError::UnknownCustomOp(source))?
                        .clone();
                    let attrs = strip_markers(&op.attrs);
                    self.builder
                        .emit_custom(&ident, &inputs, output_names.len(), &attrs, &debug_id)?
                }
                ty => {
                    let schema = schema::find_schema(ty)
                        .ok_or_else(|| CompileError::NotRegistered(ty.to_string()))?;
                    let attrs = schema::project_attrs(schema, &op.attrs)?;
                    self.builder
                        .emit(ty, &inputs, &attrs, output_names.len(), &debug_id)?
                }
            };

            self.set_placement(&op.attrs, &ids)?;
            if op.ty == "npu_matmul" {
                self.set_matmul_memory(&ids)?;
                self.set_matmul_serialization(&op.attrs, &ids)?;
            }
            self.insert_tensors(&op.ty, &output_names, ids)?;
        }
        Ok(())
    }

    /// Marks each fetch as a program output.
    pub fn init_outputs(&mut self, fetch_list: &[String]) -> Result<(), CompileError> {
        for name in fetch_list {
            let id = self
                .tensors
                .get(name)
                .cloned()
                .ok_or_else(|| CompileError::FetchNotFound(name.clone()))?;
            self.builder.add_output(&id)?;
            self.outputs.push(id);
        }
        Ok(())
    }

    /// Rewrites the assembled program to half precision.
    pub fn convert_to_fp16(&mut self) -> Result<(), CompileError> {
        self.builder.convert_floats_to_halfs()?;
        self.fp16 = true;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), CompileError> {
        Ok(self.builder.save_model(path)?)
    }

    /// Seals the program and collects the shapes the builder can resolve.
    pub fn finish(self) -> Result<CompiledProgram, CompileError> {
        let blob = self.builder.model_blob()?;
        let mut shapes = BTreeMap::new();
        for id in self.tensors.values() {
            if let Ok(shape) = self.builder.tensor_shape(id) {
                shapes.insert(id.clone(), shape);
            }
        }
        Ok(CompiledProgram {
            blob,
            tensors: self.tensors,
            inputs: self.inputs,
            outputs: self.outputs,
            weights: self.weights,
            shapes,
            fp16: self.fp16,
        })
    }

    /// Resolves positional inputs: symbol-table hits become tensor ids, the
    /// rest pass through by name for the builder to resolve.
    fn gather_inputs(&self, graph: &Graph, op_id: NodeId) -> Result<Vec<TensorId>, CompileError> {
        let op = graph.op(op_id)?;
        let mut ids = Vec::with_capacity(op.inputs.len());
        for &var_id in &op.inputs {
            let name = &graph.var(var_id)?.name;
            match self.tensors.get(name) {
                Some(id) => ids.push(id.clone()),
                None => ids.push(name.clone()),
            }
        }
        Ok(ids)
    }

    fn output_names(&self, graph: &Graph, op_id: NodeId) -> Result<Vec<String>, CompileError> {
        let op = graph.op(op_id)?;
        let mut names = Vec::with_capacity(op.outputs.len());
        for &var_id in &op.outputs {
            names.push(graph.var(var_id)?.name.clone());
        }
        Ok(names)
    }

    fn lower_constant(&mut self, attrs: &AttrMap, debug_id: &str) -> Result<TensorId, CompileError> {
        let tag = attrs.get_int("dtype")?;
        let dtype = DType::from_tag(tag).ok_or(CompileError::UnsupportedConstant(tag))?;
        let dims = attrs.get_ints("dims")?;
        let value = match dtype {
            DType::F32 => ConstantValue::F32(attrs.get_floats("value")?),
            DType::F16 => ConstantValue::F16(
                attrs
                    .get_floats("value")?
                    .into_iter()
                    .map(f16::from_f32)
                    .collect(),
            ),
            DType::F64 => ConstantValue::F64(attrs.get_doubles("value")?),
            DType::I32 => ConstantValue::I32(attrs.get_int32s("value")?),
            DType::I64 => ConstantValue::I64(attrs.get_ints("value")?),
            _ => return Err(CompileError::UnsupportedConstant(tag)),
        };
        Ok(self.builder.add_constant(&value, &dims, debug_id)?)
    }

    /// Applies device and pipeline placement markers. A pipeline stage is
    /// only honored when a device index is also present.
    fn set_placement(&mut self, attrs: &AttrMap, ids: &[TensorId]) -> Result<(), CompileError> {
        let Some(device_index) = attrs.opt_int(DEVICE_INDEX_ATTR) else {
            return Ok(());
        };
        self.builder.virtual_graph(ids, device_index)?;
        if let Some(stage) = attrs.opt_int(PIPELINE_STAGE_ATTR) {
            self.builder.pipeline_stage(ids, stage)?;
        }
        Ok(())
    }

    fn set_matmul_memory(&mut self, ids: &[TensorId]) -> Result<(), CompileError> {
        let amp = self.strategy.available_memory_proportion;
        if amp <= 0.0 {
            return Ok(());
        }
        if amp > 1.0 {
            return Err(CompileError::MemoryProportion(amp));
        }
        self.builder.set_available_memory_proportion(ids, amp)?;
        Ok(())
    }

    fn set_matmul_serialization(
        &mut self,
        attrs: &AttrMap,
        ids: &[TensorId],
    ) -> Result<(), CompileError> {
        let Some(factor) = attrs.opt_int(SERIALIZE_FACTOR_ATTR) else {
            return Ok(());
        };
        let mode = attrs.get_str_or(SERIALIZE_MODE_ATTR, SERIALIZE_MODE_DEFAULT);
        self.builder.set_serialize_matmul(ids, &mode, factor)?;
        Ok(())
    }

    fn insert_symbol(&mut self, name: String, id: TensorId) -> Result<(), CompileError> {
        if self.tensors.contains_key(&name) {
            return Err(CompileError::DuplicateSymbol(name));
        }
        self.tensors.insert(name, id);
        Ok(())
    }

    fn insert_tensors(
        &mut self,
        op: &str,
        names: &[String],
        ids: Vec<TensorId>,
    ) -> Result<(), CompileError> {
        if names.len() != ids.len() {
            return Err(CompileError::OutputArity {
                op: op.to_string(),
                expected: names.len(),
                got: ids.len(),
            });
        }
        for (name, id) in names.iter().zip(ids) {
            self.insert_symbol(name.clone(), id)?;
        }
        Ok(())
    }
}

/// Drops bridge-internal markers before attrs reach a user operator.
fn strip_markers(attrs: &AttrMap) -> AttrMap {
    attrs
        .iter()
        .filter(|(name, _)| {
            ![
                OP_TYPE_ATTR,
                OP_IDENT_ATTR,
                DEVICE_INDEX_ATTR,
                PIPELINE_STAGE_ATTR,
            ]
            .contains(&name.as_str())
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
