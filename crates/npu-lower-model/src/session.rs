//! Session over a deserialized model program.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info};

use npu_lower::builder::TensorId;
use npu_lower::device::{BackendError, DataFlow, Session, StepIo, WeightBuffer};
use npu_lower::dtype::DType;
use npu_lower::optimizer::OptimizerConfig;
use npu_lower::storage::HostBuffer;

use crate::interp::{self, Value};
use crate::program::ModelProgram;

/// Forward interpreter session.
///
/// Training sessions execute the same forward program and track optimizer
/// updates; the model device mirrors the bridge contract, not the hardware
/// math, so no gradient step is applied.
pub struct ModelSession {
    program: ModelProgram,
    dataflow: DataFlow,
    /// Live weight values, overriding the program's initializer payloads.
    weights: HashMap<TensorId, Value>,
    optimizer: Option<OptimizerConfig>,
    loss: Option<TensorId>,
    prepared: bool,
}

impl ModelSession {
    pub fn inference(blob: &[u8], dataflow: &DataFlow) -> Result<Self, BackendError> {
        Ok(Self {
            program: ModelProgram::from_blob(blob)?,
            dataflow: dataflow.clone(),
            weights: HashMap::new(),
            optimizer: None,
            loss: None,
            prepared: false,
        })
    }

    pub fn training(
        blob: &[u8],
        dataflow: &DataFlow,
        loss: &TensorId,
        optimizer: &OptimizerConfig,
    ) -> Result<Self, BackendError> {
        let program = ModelProgram::from_blob(blob)?;
        if !program.contains(loss) {
            return Err(BackendError::spec(format!(
                "loss tensor `{loss}` is not in the program"
            )));
        }
        Ok(Self {
            program,
            dataflow: dataflow.clone(),
            weights: HashMap::new(),
            optimizer: Some(optimizer.clone()),
            loss: Some(loss.clone()),
            prepared: false,
        })
    }

    pub fn optimizer(&self) -> Option<&OptimizerConfig> {
        self.optimizer.as_ref()
    }

    /// Loss anchor of a training session.
    pub fn loss(&self) -> Option<&TensorId> {
        self.loss.as_ref()
    }

    /// Environment seeded with constants and current weights.
    fn base_env(&self) -> Result<HashMap<TensorId, Value>, BackendError> {
        let mut env = HashMap::new();
        for entry in self
            .program
            .constants
            .iter()
            .chain(self.program.initializers.iter())
        {
            env.insert(
                entry.id.clone(),
                Value::from_bytes(entry.dtype, entry.shape.clone(), &entry.bytes)?,
            );
        }
        for (id, value) in &self.weights {
            env.insert(id.clone(), value.clone());
        }
        Ok(env)
    }
}

impl Session for ModelSession {
    fn prepare_device(&mut self) -> Result<(), BackendError> {
        info!(
            "model session prepared: {} nodes, {} anchors",
            self.program.nodes.len(),
            self.dataflow.anchors.len()
        );
        self.prepared = true;
        Ok(())
    }

    fn weights_from_host(&mut self, weights: &[WeightBuffer]) -> Result<(), BackendError> {
        for weight in weights {
            let value = Value::from_bytes(
                weight.buffer.dtype(),
                weight.buffer.shape().to_vec(),
                weight.buffer.bytes(),
            )?;
            self.weights.insert(weight.id.clone(), value);
        }
        debug!("synced {} weights to device", weights.len());
        Ok(())
    }

    fn weights_to_host(&mut self, ids: &[TensorId]) -> Result<Vec<WeightBuffer>, BackendError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let value = match self.weights.get(id) {
                Some(v) => v.clone(),
                None => {
                    let entry = self
                        .program
                        .initializers
                        .iter()
                        .find(|e| &e.id == id)
                        .ok_or_else(|| {
                            BackendError::execution(format!("weight `{id}` is not in the program"))
                        })?;
                    Value::from_bytes(entry.dtype, entry.shape.clone(), &entry.bytes)?
                }
            };
            out.push(WeightBuffer {
                id: id.clone(),
                buffer: HostBuffer::new(value.dtype, value.shape.clone(), value.to_bytes()?),
            });
        }
        Ok(out)
    }

    fn run(&mut self, io: &mut StepIo<'_>) -> Result<(), BackendError> {
        if !self.prepared {
            return Err(BackendError::execution("session was never prepared"));
        }
        let steps = self.dataflow.batches_per_step.max(1);
        let base = self.base_env()?;

        for step in 0..steps {
            let mut env = base.clone();
            for binding in &io.inputs {
                // With batching the host buffer carries a prepended step dim.
                let (shape, bytes) = if steps > 1 {
                    let chunk = binding.data.len() / steps;
                    (
                        binding.shape[1..].to_vec(),
                        &binding.data[step * chunk..(step + 1) * chunk],
                    )
                } else {
                    (binding.shape.clone(), binding.data)
                };
                env.insert(
                    binding.id.clone(),
                    Value::from_bytes(binding.dtype, shape, bytes)?,
                );
            }

            for node in &self.program.nodes {
                interp::execute_node(node, &mut env)?;
            }

            for binding in io.outputs.iter_mut() {
                let value = env.get(&binding.id).ok_or_else(|| {
                    BackendError::execution(format!(
                        "anchor `{}` was not produced by the program",
                        binding.id
                    ))
                })?;
                let bytes = value.to_bytes_as(binding.dtype)?;
                let chunk = binding.data.len() / steps;
                if bytes.len() != chunk {
                    return Err(BackendError::execution(format!(
                        "anchor `{}` produced {} bytes per step, binding holds {}",
                        binding.id,
                        bytes.len(),
                        chunk
                    )));
                }
                binding.data[step * chunk..(step + 1) * chunk].copy_from_slice(&bytes);
            }
        }
        Ok(())
    }

    fn update_optimizer(&mut self, config: &OptimizerConfig) -> Result<(), BackendError> {
        if self.optimizer.is_none() {
            return Err(BackendError::spec(
                "optimizer update on an inference session",
            ));
        }
        self.optimizer = Some(config.clone());
        Ok(())
    }

    fn anchor_shape(&self, id: &TensorId) -> Result<Vec<i64>, BackendError> {
        self.program
            .meta(id)
            .map(|m| m.shape.clone())
            .ok_or_else(|| BackendError::execution(format!("anchor `{id}` has no resolved shape")))
    }

    fn anchor_dtype(&self, id: &TensorId) -> Result<DType, BackendError> {
        self.program
            .meta(id)
            .map(|m| m.dtype)
            .ok_or_else(|| BackendError::execution(format!("anchor `{id}` has no resolved dtype")))
    }

    fn contains_tensor(&self, id: &TensorId) -> bool {
        self.program.contains(id)
    }

    fn save_program(&self, path: &Path) -> Result<(), BackendError> {
        std::fs::write(path, self.program.to_blob()?)?;
        Ok(())
    }
}
