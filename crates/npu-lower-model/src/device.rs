//! Device pool and runtime entry point for the model device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

use npu_lower::builder::{ProgramBuilder, TensorId};
use npu_lower::device::{BackendError, DataFlow, Device, NpuRuntime, Session};
use npu_lower::optimizer::OptimizerConfig;

use crate::builder::ModelBuilder;
use crate::session::ModelSession;

/// An acquired model device. The pool slot frees itself on drop.
pub struct ModelDevice {
    index: usize,
    slot: Arc<AtomicBool>,
}

impl Device for ModelDevice {
    fn index(&self) -> usize {
        self.index
    }
}

impl Drop for ModelDevice {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
        info!("released model device {}", self.index);
    }
}

/// Fixed-size pool of virtual devices with exclusive acquisition.
pub struct ModelDeviceManager {
    slots: Vec<Arc<AtomicBool>>,
}

impl ModelDeviceManager {
    pub fn new(num_devices: usize) -> Self {
        Self {
            slots: (0..num_devices)
                .map(|_| Arc::new(AtomicBool::new(false)))
                .collect(),
        }
    }

    pub fn num_devices(&self) -> usize {
        self.slots.len()
    }

    pub fn acquire(&self, index: usize) -> Result<ModelDevice, BackendError> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| BackendError::spec(format!("device index {index} out of range")))?;
        if slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BackendError::execution(format!("device {index} is busy")));
        }
        info!("acquired model device {index}");
        Ok(ModelDevice {
            index,
            slot: Arc::clone(slot),
        })
    }
}

/// In-process runtime backed by the interpreter.
pub struct ModelRuntime {
    devices: ModelDeviceManager,
}

impl ModelRuntime {
    pub fn new(num_devices: usize) -> Self {
        Self {
            devices: ModelDeviceManager::new(num_devices),
        }
    }
}

impl NpuRuntime for ModelRuntime {
    fn create_builder(&self) -> Box<dyn ProgramBuilder> {
        Box::new(ModelBuilder::new())
    }

    fn num_devices(&self) -> usize {
        self.devices.num_devices()
    }

    fn acquire_device(&self, index: usize) -> Result<Box<dyn Device>, BackendError> {
        Ok(Box::new(self.devices.acquire(index)?))
    }

    fn create_inference_session(
        &self,
        blob: &[u8],
        dataflow: &DataFlow,
        _device: &dyn Device,
    ) -> Result<Box<dyn Session>, BackendError> {
        Ok(Box::new(ModelSession::inference(blob, dataflow)?))
    }

    fn create_training_session(
        &self,
        blob: &[u8],
        dataflow: &DataFlow,
        loss: &TensorId,
        optimizer: &OptimizerConfig,
        _device: &dyn Device,
    ) -> Result<Box<dyn Session>, BackendError> {
        Ok(Box::new(ModelSession::training(
            blob, dataflow, loss, optimizer,
        )?))
    }
}
