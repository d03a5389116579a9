//! In-process reference runtime for the graph-compilation bridge.
//!
//! Implements the `npu-lower` collaborator traits with a bincode-serialized
//! program format and a float32 interpreter, so the whole bridge pipeline
//! can run without accelerator hardware. Half-precision programs are stored
//! as f16 and computed as f32.

pub mod builder;
pub mod device;
pub mod interp;
pub mod program;
pub mod session;

pub use builder::ModelBuilder;
pub use device::{ModelDevice, ModelDeviceManager, ModelRuntime};
pub use program::{ModelNode, ModelProgram, TensorMeta};
pub use session::ModelSession;
