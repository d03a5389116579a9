//! Runtime, device and session seams implemented by accelerator backends.

use std::path::Path;

use thiserror::Error;

use crate::builder::{ProgramBuilder, TensorId};
use crate::dtype::DType;
use crate::optimizer::OptimizerConfig;
use crate::storage::HostBuffer;

/// Failures surfaced by a backend implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("spec violation: {0}")]
    SpecViolation(String),
    #[error("unimplemented: {0}")]
    Unimplemented(String),
    #[error("execution failure: {0}")]
    Execution(String),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn spec(message: impl Into<String>) -> Self {
        BackendError::SpecViolation(message.into())
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        BackendError::Unimplemented(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution(message.into())
    }
}

/// An acquired device. Dropping the handle releases the device.
pub trait Device: Send {
    fn index(&self) -> usize;
}

/// Anchor configuration for a session: how many device steps one `run` call
/// covers and which tensors are returned.
#[derive(Debug, Clone, Default)]
pub struct DataFlow {
    pub batches_per_step: usize,
    pub anchors: Vec<TensorId>,
}

/// One immutable input binding for a step.
pub struct IoBinding<'a> {
    pub id: TensorId,
    pub dtype: DType,
    pub shape: Vec<i64>,
    pub data: &'a [u8],
}

/// One mutable output binding for a step.
pub struct IoBindingMut<'a> {
    pub id: TensorId,
    pub dtype: DType,
    pub shape: Vec<i64>,
    pub data: &'a mut [u8],
}

/// Zero-copy step bindings: the session reads inputs from and writes anchors
/// into caller-owned buffers.
pub struct StepIo<'a> {
    pub inputs: Vec<IoBinding<'a>>,
    pub outputs: Vec<IoBindingMut<'a>>,
}

/// A weight tensor in device layout, addressed by program tensor id.
#[derive(Debug, Clone)]
pub struct WeightBuffer {
    pub id: TensorId,
    pub buffer: HostBuffer,
}

/// A compiled program bound to a device.
pub trait Session {
    fn prepare_device(&mut self) -> Result<(), BackendError>;

    fn weights_from_host(&mut self, weights: &[WeightBuffer]) -> Result<(), BackendError>;

    fn weights_to_host(&mut self, ids: &[TensorId]) -> Result<Vec<WeightBuffer>, BackendError>;

    fn run(&mut self, io: &mut StepIo<'_>) -> Result<(), BackendError>;

    fn update_optimizer(&mut self, config: &OptimizerConfig) -> Result<(), BackendError>;

    fn anchor_shape(&self, id: &TensorId) -> Result<Vec<i64>, BackendError>;

    fn anchor_dtype(&self, id: &TensorId) -> Result<DType, BackendError>;

    fn contains_tensor(&self, id: &TensorId) -> bool;

    fn save_program(&self, path: &Path) -> Result<(), BackendError>;
}

/// Entry point a runtime exposes to the bridge.
pub trait NpuRuntime {
    fn create_builder(&self) -> Box<dyn ProgramBuilder>;

    fn num_devices(&self) -> usize;

    /// Acquires exclusive use of one device.
    fn acquire_device(&self, index: usize) -> Result<Box<dyn Device>, BackendError>;

    fn create_inference_session(
        &self,
        blob: &[u8],
        dataflow: &DataFlow,
        device: &dyn Device,
    ) -> Result<Box<dyn Session>, BackendError>;

    fn create_training_session(
        &self,
        blob: &[u8],
        dataflow: &DataFlow,
        loss: &TensorId,
        optimizer: &OptimizerConfig,
        device: &dyn Device,
    ) -> Result<Box<dyn Session>, BackendError>;
}
