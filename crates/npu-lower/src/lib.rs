//! Graph-compilation bridge between a define-by-graph front end and an
//! accelerator runtime.
//!
//! The pipeline has four stages. Canonicalization rewrites front-end
//! operators into a normalized `npu_` vocabulary through a handler registry.
//! The lowering engine walks the normalized graph in topological order and
//! drives a runtime-provided [`builder::ProgramBuilder`], keeping a symbol
//! table from variable names to program tensor ids. Optimizer metadata is
//! extracted from the training graph and mapped to a runtime configuration.
//! Finally the executor binds the compiled program to an acquired device and
//! steps it with zero-copy anchor buffers.
//!
//! The runtime itself is behind the [`device::NpuRuntime`] seam; the
//! `npu-lower-model` crate provides an in-process reference implementation.

pub mod attr;
pub mod backend;
pub mod builder;
pub mod canonicalize;
pub mod compiler;
pub mod convert;
pub mod device;
pub mod dtype;
pub mod executor;
pub mod ir;
pub mod names;
pub mod optimizer;
pub mod storage;
pub mod strategy;

pub use attr::{AttrMap, AttrValue};
pub use backend::NpuBackend;
pub use builder::{ConstantValue, CustomOpIdentifier, ProgramBuilder, TensorId, TensorInfo};
pub use canonicalize::{canonicalize_graph, HandlerRegistry};
pub use compiler::{CompiledProgram, Compiler};
pub use device::{BackendError, DataFlow, Device, NpuRuntime, Session, StepIo, WeightBuffer};
pub use dtype::DType;
pub use executor::Executor;
pub use ir::{Graph, NodeId};
pub use optimizer::{build_optimizer, extract_optimizer, OptimizerConfig, OptimizerKind};
pub use storage::{HostBuffer, InMemoryStorage, VariableStorage};
pub use strategy::Strategy;
