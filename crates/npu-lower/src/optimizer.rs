//! Optimizer metadata extracted from the training graph and its mapping to
//! the runtime's optimizer configuration.

use std::collections::HashMap;

use thiserror::Error;

use crate::attr::AttrValue;
use crate::dtype::DType;
use crate::ir::Graph;
use crate::names::{OP_ROLE_ATTR, OP_ROLE_OPTIMIZE};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptimError {
    #[error("optimizer type has not been set")]
    TypeNotSet,
    #[error("optimizer `{0}` is not implemented")]
    Unimplemented(String),
}

/// Optimizer facts gathered from the front-end graph. Attrs are the float
/// attributes of the update op, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct OptimizerMeta {
    kind: String,
    loss: String,
    lr_var: String,
    lr: f32,
    attrs: HashMap<String, f32>,
}

impl OptimizerMeta {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn set_kind(&mut self, kind: impl Into<String>) {
        self.kind = kind.into();
    }

    pub fn loss(&self) -> &str {
        &self.loss
    }

    pub fn set_loss(&mut self, loss: impl Into<String>) {
        self.loss = loss.into();
    }

    pub fn lr_var(&self) -> &str {
        &self.lr_var
    }

    pub fn set_lr_var(&mut self, name: impl Into<String>) {
        self.lr_var = name.into();
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: f32) {
        self.attrs.insert(name.into(), value);
    }

    pub fn attr(&self, name: &str, default: f32) -> f32 {
        self.attrs.get(name).copied().unwrap_or(default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

/// Runtime-facing optimizer settings. `None` is the "unset" sentinel: the
/// runtime keeps its own default and the field is not pushed to the device.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f32,
    pub weight_decay: Option<f32>,
    pub momentum: Option<f32>,
    pub dampening: Option<f32>,
    pub velocity_scaling: Option<f32>,
    pub loss_scaling: Option<f32>,
    pub beta1: Option<f32>,
    pub beta2: Option<f32>,
    pub epsilon: Option<f32>,
    /// Accumulator dtype for stateful optimizers.
    pub accum_dtype: DType,
}

/// Maps extracted metadata to a concrete configuration.
///
/// sgd sets only the learning rate and leaves every other field unset. adam
/// additionally pins beta1/beta2/epsilon, with float32 accumulators and
/// decay-mode weight decay fixed by the bridge.
pub fn build_optimizer(meta: &OptimizerMeta) -> Result<OptimizerConfig, OptimError> {
    match meta.kind() {
        "" => Err(OptimError::TypeNotSet),
        "sgd" => Ok(OptimizerConfig {
            kind: OptimizerKind::Sgd,
            lr: meta.lr(),
            weight_decay: None,
            momentum: None,
            dampening: None,
            velocity_scaling: None,
            loss_scaling: None,
            beta1: None,
            beta2: None,
            epsilon: None,
            accum_dtype: DType::F32,
        }),
        "adam" => Ok(OptimizerConfig {
            kind: OptimizerKind::Adam,
            lr: meta.lr(),
            weight_decay: None,
            momentum: None,
            dampening: None,
            velocity_scaling: None,
            loss_scaling: None,
            beta1: Some(meta.attr("beta1", 0.9)),
            beta2: Some(meta.attr("beta2", 0.999)),
            epsilon: Some(meta.attr("epsilon", 1e-8)),
            accum_dtype: DType::F32,
        }),
        other => Err(OptimError::Unimplemented(other.to_string())),
    }
}

/// Device/host naming scheme for optimizer state tensors.
///
/// Each pair is `(device prefix, host postfix)`: the device-side tensor is
/// `prefix + weight` and the host-side variable is `weight + postfix`. The
/// bare pair covers the weight itself.
pub fn opt_pre_postfix(kind: &str) -> Result<Vec<(String, String)>, OptimError> {
    let mut pairs = vec![(String::new(), String::new())];
    match kind {
        "sgd" => {}
        "adam" => {
            pairs.push(("Accl1___".to_string(), "_moment1_0".to_string()));
            pairs.push(("Accl2___".to_string(), "_moment2_0".to_string()));
        }
        other => return Err(OptimError::Unimplemented(other.to_string())),
    }
    Ok(pairs)
}

/// Scans the graph for optimizer-role ops and collects their metadata.
///
/// Training graphs usually carry one update op per parameter with identical
/// type and attrs, so later ops simply overwrite with the same values.
pub fn extract_optimizer(graph: &Graph) -> Option<OptimizerMeta> {
    let mut meta: Option<OptimizerMeta> = None;
    for op_id in graph.op_ids() {
        let Ok(op) = graph.op(op_id) else { continue };
        if op.attrs.get_int_or(OP_ROLE_ATTR, 0) != OP_ROLE_OPTIMIZE {
            continue;
        }
        let entry = meta.get_or_insert_with(OptimizerMeta::default);
        entry.set_kind(op.ty.clone());
        for (name, value) in op.attrs.iter() {
            if let AttrValue::Float(v) = value {
                entry.set_attr(name.clone(), *v);
            }
        }
        if let Some(lr_names) = op.slot_inputs.get("LearningRate") {
            if let Some(lr) = lr_names.first() {
                entry.set_lr_var(lr.clone());
            }
        }
    }
    meta
}
