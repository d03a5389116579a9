//! Execution session: binds a compiled program to a device and steps it.

use log::{debug, info, warn};
use thiserror::Error;

use crate::builder::TensorId;
use crate::compiler::CompiledProgram;
use crate::convert::{self, ConvertError};
use crate::device::{
    BackendError, DataFlow, Device, IoBinding, IoBindingMut, NpuRuntime, Session, StepIo,
    WeightBuffer,
};
use crate::dtype::DType;
use crate::optimizer::{build_optimizer, opt_pre_postfix, OptimError, OptimizerMeta};
use crate::storage::{HostBuffer, VariableStorage};
use crate::strategy::Strategy;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("session has not been prepared")]
    NotPrepared,
    #[error("no device is attached")]
    DeviceNotAttached,
    #[error("loss variable `{0}` was not lowered into the program")]
    LossNotFound(String),
    #[error("fetch `{0}` was not lowered into the program")]
    FetchNotFound(String),
    #[error("learning rate variable `{0}` is missing from storage")]
    LearningRateMissing(String),
    #[error("learning rate must be a float32 scalar, found {0}")]
    LearningRateDType(DType),
    #[error("feed `{0}` is missing from storage")]
    FeedMissing(String),
    #[error(transparent)]
    Optim(#[from] OptimError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Owns the runtime session for one compiled program and drives its steps.
pub struct Executor {
    strategy: Strategy,
    opt: OptimizerMeta,
    program: Option<CompiledProgram>,
    session: Option<Box<dyn Session>>,
    /// `(device tensor id, host variable name)` pairs kept in sync.
    weight_pairs: Vec<(TensorId, String)>,
    step: u64,
}

impl Executor {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            opt: OptimizerMeta::default(),
            program: None,
            session: None,
            weight_pairs: Vec::new(),
            step: 0,
        }
    }

    pub fn set_optimizer(&mut self, opt: OptimizerMeta) {
        self.opt = opt;
    }

    pub fn optimizer(&self) -> &OptimizerMeta {
        &self.opt
    }

    pub fn is_prepared(&self) -> bool {
        self.session.is_some()
    }

    /// Creates the runtime session, uploads weights and readies the device.
    ///
    /// Training requires the loss variable to have been lowered; its program
    /// tensor id anchors the backward pass.
    pub fn prepare(
        &mut self,
        program: CompiledProgram,
        runtime: &dyn NpuRuntime,
        device: Option<&dyn Device>,
        storage: &dyn VariableStorage,
    ) -> Result<(), ExecError> {
        let device = device.ok_or(ExecError::DeviceNotAttached)?;
        let dataflow = DataFlow {
            batches_per_step: self.strategy.batches_per_step,
            anchors: program.outputs.clone(),
        };

        let mut session = if self.strategy.is_training {
            let loss = program
                .tensor(self.opt.loss())
                .cloned()
                .ok_or_else(|| ExecError::LossNotFound(self.opt.loss().to_string()))?;
            let config = build_optimizer(&self.opt)?;
            runtime.create_training_session(&program.blob, &dataflow, &loss, &config, device)?
        } else {
            runtime.create_inference_session(&program.blob, &dataflow, device)?
        };
        info!(
            "created {} session with {} anchors",
            if self.strategy.is_training { "training" } else { "inference" },
            dataflow.anchors.len()
        );

        self.weight_pairs = plan_weight_pairs(
            &program,
            session.as_ref(),
            storage,
            if self.strategy.is_training { self.opt.kind() } else { "sgd" },
        )?;

        session.prepare_device()?;
        self.upload_weights(session.as_mut(), &program, storage)?;

        self.program = Some(program);
        self.session = Some(session);
        self.step = 0;
        Ok(())
    }

    /// Runs one host step: binds feeds straight from storage, stages each
    /// fetch in a scratch buffer, refreshes the learning rate when training,
    /// and honors the checkpoint cadence.
    pub fn run(
        &mut self,
        feed_list: &[String],
        fetch_list: &[String],
        storage: &mut dyn VariableStorage,
    ) -> Result<(), ExecError> {
        if self.program.is_none() {
            return Err(ExecError::NotPrepared);
        }

        if self.strategy.is_training {
            let lr = self.read_learning_rate(storage)?;
            self.opt.set_lr(lr);
            let config = build_optimizer(&self.opt)?;
            let session = self.session.as_mut().ok_or(ExecError::NotPrepared)?;
            session.update_optimizer(&config)?;
            debug!("refreshed learning rate to {lr}");
        }

        let program = self.program.as_ref().ok_or(ExecError::NotPrepared)?;
        let session = self.session.as_mut().ok_or(ExecError::NotPrepared)?;

        // Anchors gain leading dims for batches per step, accumulation and
        // replication. Fetches are staged in scratch buffers and moved into
        // storage after the step.
        let mut fetch_slots: Vec<(String, TensorId, HostBuffer)> =
            Vec::with_capacity(fetch_list.len());
        for name in fetch_list {
            if fetch_slots.iter().any(|(n, _, _)| n == name) {
                continue;
            }
            let id = program
                .tensor(name)
                .cloned()
                .ok_or_else(|| ExecError::FetchNotFound(name.clone()))?;
            let mut shape = session.anchor_shape(&id)?;
            for factor in [
                self.strategy.replication_factor,
                self.strategy.accumulation_factor,
                self.strategy.batches_per_step,
            ] {
                if factor > 1 {
                    shape.insert(0, factor as i64);
                }
            }
            match storage.find(name) {
                Some(buffer) => {
                    fetch_slots.push((name.clone(), id, HostBuffer::zeros(buffer.dtype(), shape)))
                }
                None => warn!("fetch {name} has no storage slot, output dropped"),
            }
        }

        {
            let mut inputs = Vec::with_capacity(feed_list.len());
            for name in feed_list {
                let buffer = storage
                    .find(name)
                    .ok_or_else(|| ExecError::FeedMissing(name.clone()))?;
                let id = program
                    .tensor(name)
                    .cloned()
                    .ok_or_else(|| ExecError::FeedMissing(name.clone()))?;
                inputs.push(IoBinding {
                    id,
                    dtype: buffer.dtype(),
                    shape: buffer.shape().to_vec(),
                    data: buffer.bytes(),
                });
            }

            let mut outputs = Vec::with_capacity(fetch_slots.len());
            for (_, id, buffer) in fetch_slots.iter_mut() {
                outputs.push(IoBindingMut {
                    id: id.clone(),
                    dtype: buffer.dtype(),
                    shape: buffer.shape().to_vec(),
                    data: buffer.bytes_mut(),
                });
            }

            let mut io = StepIo { inputs, outputs };
            session.run(&mut io)?;
        }

        for (name, _, buffer) in fetch_slots {
            if let Some(slot) = storage.find_mut(&name) {
                *slot = buffer;
            }
        }

        self.step += 1;
        if self.strategy.save_per_n_step > 0 && self.step % self.strategy.save_per_n_step == 0 {
            self.sync_weights_to_host(storage)?;
            if let Some(path) = self.strategy.save_path.clone() {
                let session = self.session.as_ref().ok_or(ExecError::NotPrepared)?;
                session.save_program(&path)?;
                info!("checkpointed program to {}", path.display());
            }
        }
        Ok(())
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Copies every synced weight from the device back into host storage,
    /// widening half precision where the host keeps float32.
    pub fn sync_weights_to_host(
        &mut self,
        storage: &mut dyn VariableStorage,
    ) -> Result<(), ExecError> {
        let session = self.session.as_mut().ok_or(ExecError::NotPrepared)?;
        let ids: Vec<TensorId> = self.weight_pairs.iter().map(|(id, _)| id.clone()).collect();
        let weights = session.weights_to_host(&ids)?;
        for (weight, (_, host_name)) in weights.iter().zip(&self.weight_pairs) {
            if let Some(host) = storage.find_mut(host_name) {
                convert::device_to_host(weight.buffer.bytes(), weight.buffer.dtype(), host)?;
            }
        }
        Ok(())
    }

    fn upload_weights(
        &self,
        session: &mut dyn Session,
        program: &CompiledProgram,
        storage: &dyn VariableStorage,
    ) -> Result<(), ExecError> {
        let mut weights = Vec::with_capacity(self.weight_pairs.len());
        for (device_id, host_name) in &self.weight_pairs {
            let Some(host) = storage.find(host_name) else {
                continue;
            };
            let device_dtype = if program.fp16 && host.dtype() == DType::F32 {
                DType::F16
            } else {
                host.dtype()
            };
            let bytes = convert::host_to_device(host, device_dtype)?;
            weights.push(WeightBuffer {
                id: device_id.clone(),
                buffer: HostBuffer::new(device_dtype, host.shape().to_vec(), bytes),
            });
        }
        session.weights_from_host(&weights)?;
        Ok(())
    }

    fn read_learning_rate(&self, storage: &dyn VariableStorage) -> Result<f32, ExecError> {
        let name = self.opt.lr_var();
        let buffer = storage
            .find(name)
            .ok_or_else(|| ExecError::LearningRateMissing(name.to_string()))?;
        if buffer.dtype() != DType::F32 || buffer.numel() != 1 {
            return Err(ExecError::LearningRateDType(buffer.dtype()));
        }
        let values = buffer
            .to_f32_vec()
            .ok_or(ExecError::LearningRateDType(buffer.dtype()))?;
        Ok(values[0])
    }
}

/// Plans device/host weight sync pairs from the optimizer naming scheme.
///
/// A pair is kept only when the device-side tensor exists in the program and
/// the host-side variable exists in storage; optimizer state the runtime
/// never materialized is silently skipped.
fn plan_weight_pairs(
    program: &CompiledProgram,
    session: &dyn Session,
    storage: &dyn VariableStorage,
    opt_kind: &str,
) -> Result<Vec<(TensorId, String)>, ExecError> {
    let scheme = opt_pre_postfix(opt_kind)?;
    let mut pairs = Vec::new();
    for weight_id in &program.weights {
        for (prefix, postfix) in &scheme {
            let device_name = format!("{prefix}{weight_id}");
            let host_name = format!("{weight_id}{postfix}");
            if !session.contains_tensor(&device_name) {
                continue;
            }
            if storage.find(&host_name).is_none() {
                continue;
            }
            pairs.push((device_name, host_name));
        }
    }
    Ok(pairs)
}
