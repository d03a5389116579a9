//! The program-builder seam between the lowering engine and a runtime.
//!
//! A runtime hands the compiler an opaque builder; the compiler drives it op
//! by op and never looks inside the program it assembles.

use std::path::Path;

use half::f16;

use crate::attr::AttrMap;
use crate::device::BackendError;
use crate::dtype::DType;
use crate::storage::HostBuffer;

/// Opaque tensor identifier minted by a builder.
pub type TensorId = String;

/// Static description of a program input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub dtype: DType,
    pub shape: Vec<i64>,
}

impl TensorInfo {
    pub fn new(dtype: DType, shape: Vec<i64>) -> Self {
        Self { dtype, shape }
    }
}

/// Typed payload of a program constant.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl ConstantValue {
    pub fn dtype(&self) -> DType {
        match self {
            ConstantValue::F16(_) => DType::F16,
            ConstantValue::F32(_) => DType::F32,
            ConstantValue::F64(_) => DType::F64,
            ConstantValue::I32(_) => DType::I32,
            ConstantValue::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ConstantValue::F16(v) => v.len(),
            ConstantValue::F32(v) => v.len(),
            ConstantValue::F64(v) => v.len(),
            ConstantValue::I32(v) => v.len(),
            ConstantValue::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identifies a user-registered operator: the front-end type it replaces and
/// the target op the runtime should instantiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomOpIdentifier {
    pub source_op: String,
    pub target_op: String,
    pub domain: String,
    pub version: i64,
}

impl CustomOpIdentifier {
    pub fn new(
        source_op: impl Into<String>,
        target_op: impl Into<String>,
        domain: impl Into<String>,
        version: i64,
    ) -> Self {
        Self {
            source_op: source_op.into(),
            target_op: target_op.into(),
            domain: domain.into(),
            version,
        }
    }
}

/// Runtime-provided program assembler.
///
/// Tensor ids are opaque strings; the compiler only threads them between
/// calls and records them in its symbol table.
pub trait ProgramBuilder {
    fn add_input(&mut self, info: &TensorInfo, name: &str) -> Result<TensorId, BackendError>;

    /// Declares a weight initialized from host data.
    fn add_initialized_input(
        &mut self,
        data: &HostBuffer,
        name: &str,
    ) -> Result<TensorId, BackendError>;

    fn add_output(&mut self, id: &TensorId) -> Result<(), BackendError>;

    /// Emits one operator and returns the ids of its `num_outputs` results.
    fn emit(
        &mut self,
        op: &str,
        inputs: &[TensorId],
        attrs: &AttrMap,
        num_outputs: usize,
        debug_id: &str,
    ) -> Result<Vec<TensorId>, BackendError>;

    fn emit_custom(
        &mut self,
        ident: &CustomOpIdentifier,
        inputs: &[TensorId],
        num_outputs: usize,
        attrs: &AttrMap,
        debug_id: &str,
    ) -> Result<Vec<TensorId>, BackendError>;

    fn add_constant(
        &mut self,
        value: &ConstantValue,
        dims: &[i64],
        debug_id: &str,
    ) -> Result<TensorId, BackendError>;

    fn tensor_shape(&self, id: &TensorId) -> Result<Vec<i64>, BackendError>;

    /// Pins the producing ops of `ids` to a device.
    fn virtual_graph(&mut self, ids: &[TensorId], device_index: i64) -> Result<(), BackendError>;

    fn pipeline_stage(&mut self, ids: &[TensorId], stage: i64) -> Result<(), BackendError>;

    fn set_available_memory_proportion(
        &mut self,
        ids: &[TensorId],
        proportion: f32,
    ) -> Result<(), BackendError>;

    fn set_serialize_matmul(
        &mut self,
        ids: &[TensorId],
        mode: &str,
        factor: i64,
    ) -> Result<(), BackendError>;

    /// Whole-program float32 to float16 conversion.
    fn convert_floats_to_halfs(&mut self) -> Result<(), BackendError>;

    /// Serialized form of the assembled program.
    fn model_blob(&self) -> Result<Vec<u8>, BackendError>;

    fn save_model(&self, path: &Path) -> Result<(), BackendError>;
}
