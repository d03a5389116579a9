//! Serialized program format for the model device.
//!
//! The builder records the lowered program as a flat node list plus tensor
//! metadata; the blob handed across the runtime seam is the bincode encoding
//! of [`ModelProgram`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use npu_lower::attr::AttrMap;
use npu_lower::device::BackendError;
use npu_lower::dtype::DType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub dtype: DType,
    pub shape: Vec<i64>,
}

/// Target of a user-registered operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTarget {
    pub target_op: String,
    pub domain: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelNode {
    pub op: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attrs: AttrMap,
    pub debug_id: String,
    pub custom: Option<CustomTarget>,
    pub device_index: Option<i64>,
    pub pipeline_stage: Option<i64>,
}

/// A tensor with an embedded payload: a weight or a program constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstEntry {
    pub id: String,
    pub dtype: DType,
    pub shape: Vec<i64>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelProgram {
    pub inputs: Vec<String>,
    pub initializers: Vec<ConstEntry>,
    pub constants: Vec<ConstEntry>,
    pub nodes: Vec<ModelNode>,
    pub outputs: Vec<String>,
    /// Metadata for every tensor whose shape the builder resolved.
    pub metas: BTreeMap<String, TensorMeta>,
    pub memory_proportion: BTreeMap<String, f32>,
    /// Matmul serialization `(mode, factor)` keyed by output tensor id.
    pub serialization: BTreeMap<String, (String, i64)>,
    pub fp16: bool,
}

impl ModelProgram {
    pub fn meta(&self, id: &str) -> Option<&TensorMeta> {
        self.metas.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.metas.contains_key(id)
            || self.initializers.iter().any(|e| e.id == id)
            || self.constants.iter().any(|e| e.id == id)
    }

    pub fn to_blob(&self) -> Result<Vec<u8>, BackendError> {
        bincode::serialize(self)
            .map_err(|e| BackendError::execution(format!("program encoding failed: {e}")))
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, BackendError> {
        bincode::deserialize(blob)
            .map_err(|e| BackendError::execution(format!("program decoding failed: {e}")))
    }
}
