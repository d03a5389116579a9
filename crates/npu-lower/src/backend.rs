//! Top-level bridge: owns the device handle, the handler registry and the
//! compile/run lifecycle for one front-end graph.

use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};

use crate::builder::CustomOpIdentifier;
use crate::canonicalize::{canonicalize_graph, HandlerRegistry};
use crate::compiler::{CompiledProgram, Compiler};
use crate::device::{Device, NpuRuntime};
use crate::executor::Executor;
use crate::ir::Graph;
use crate::optimizer::extract_optimizer;
use crate::storage::VariableStorage;
use crate::strategy::Strategy;

/// Accelerator bridge over a pluggable runtime.
pub struct NpuBackend {
    runtime: Box<dyn NpuRuntime>,
    strategy: Strategy,
    registry: HandlerRegistry,
    custom_ops: Vec<CustomOpIdentifier>,
    device: Option<Box<dyn Device>>,
    executor: Executor,
    program: Option<CompiledProgram>,
}

impl NpuBackend {
    pub fn new(runtime: Box<dyn NpuRuntime>, strategy: Strategy) -> Self {
        let executor = Executor::new(strategy.clone());
        Self {
            runtime,
            strategy,
            registry: HandlerRegistry::with_builtin_handlers(),
            custom_ops: Vec::new(),
            device: None,
            executor,
            program: None,
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Registers a user operator for both canonicalization and lowering.
    pub fn register_custom_op(&mut self, ident: CustomOpIdentifier) {
        self.custom_ops.push(ident);
    }

    pub fn device_attached(&self) -> bool {
        self.device.is_some()
    }

    /// Acquires a device. Attaching twice is a no-op.
    pub fn attach_device(&mut self, index: usize) -> Result<()> {
        if self.device.is_some() {
            warn!("device already attached, ignoring attach({index})");
            return Ok(());
        }
        let device = self
            .runtime
            .acquire_device(index)
            .with_context(|| format!("acquiring device {index}"))?;
        info!("attached device {index}");
        self.device = Some(device);
        Ok(())
    }

    /// Releases the device, if any.
    pub fn detach_device(&mut self) {
        if self.device.take().is_some() {
            info!("detached device");
        }
    }

    /// Canonicalizes and lowers the graph into a compiled program.
    ///
    /// Weights are read from `storage` during lowering; for training graphs
    /// the optimizer update ops must still be present so their metadata can
    /// be extracted before lowering skips them.
    pub fn compile(
        &mut self,
        graph: &mut Graph,
        feed_list: &[String],
        fetch_list: &[String],
        storage: &dyn VariableStorage,
    ) -> Result<()> {
        if self.program.is_some() {
            warn!("graph already compiled, skipping recompile");
            return Ok(());
        }

        if self.strategy.is_training {
            let mut meta = extract_optimizer(graph)
                .ok_or_else(|| anyhow!("training strategy but no optimizer op in the graph"))?;
            if let Some(loss) = fetch_list.first() {
                meta.set_loss(loss.clone());
            }
            self.executor.set_optimizer(meta);
        }
        erase_optimizer_ops(graph)?;

        let custom_types: HashSet<String> = self
            .custom_ops
            .iter()
            .map(|c| c.source_op.clone())
            .collect();
        canonicalize_graph(graph, &self.registry, &custom_types)
            .context("canonicalizing graph")?;

        let mut compiler = Compiler::new(self.runtime.create_builder(), self.strategy.clone());
        compiler.set_custom_ops(&self.custom_ops);
        compiler.init_inputs(graph, feed_list)?;
        compiler.lower_weights(graph, storage)?;
        compiler.lower_body(graph)?;
        compiler.init_outputs(fetch_list)?;
        if self.strategy.enable_fp16 {
            compiler.convert_to_fp16()?;
        }
        let program = compiler.finish()?;
        info!(
            "lowered graph: {} inputs, {} weights, {} outputs",
            program.inputs.len(),
            program.weights.len(),
            program.outputs.len()
        );
        self.program = Some(program);
        Ok(())
    }

    pub fn program(&self) -> Option<&CompiledProgram> {
        self.program.as_ref()
    }

    /// Shape of a lowered tensor, if the builder resolved one.
    pub fn tensor_shape(&self, name: &str) -> Option<Vec<i64>> {
        let program = self.program.as_ref()?;
        let id = program.tensor(name)?;
        program.shapes.get(id).cloned()
    }

    /// Executes one step, preparing the session on first use.
    pub fn run(
        &mut self,
        feed_list: &[String],
        fetch_list: &[String],
        storage: &mut dyn VariableStorage,
    ) -> Result<()> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| anyhow!("run called before compile"))?;
        if !self.executor.is_prepared() {
            self.executor.prepare(
                program.clone(),
                self.runtime.as_ref(),
                self.device.as_deref(),
                storage,
            )?;
        }
        self.executor.run(feed_list, fetch_list, storage)?;
        Ok(())
    }

    /// Syncs device weights back into host storage.
    pub fn weights_to_host(&mut self, storage: &mut dyn VariableStorage) -> Result<()> {
        self.executor.sync_weights_to_host(storage)?;
        Ok(())
    }
}

/// Drops parameter-update ops once their metadata has been captured; only
/// the forward graph is lowered.
fn erase_optimizer_ops(graph: &mut Graph) -> Result<()> {
    use crate::names::{OP_ROLE_ATTR, OP_ROLE_OPTIMIZE};
    for op_id in graph.op_ids() {
        let is_update = graph
            .op(op_id)
            .map(|op| op.attrs.get_int_or(OP_ROLE_ATTR, 0) == OP_ROLE_OPTIMIZE)
            .unwrap_or(false);
        if is_update {
            graph.erase_op(op_id)?;
        }
    }
    Ok(())
}
