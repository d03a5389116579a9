//! Session-level knobs controlling compilation and execution.

use std::path::PathBuf;

/// Configuration for one compile/run session.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub num_devices: usize,
    pub is_training: bool,
    /// Device-side steps folded into one `run` call.
    pub batches_per_step: usize,
    pub accumulation_factor: usize,
    pub replication_factor: usize,
    /// Matmul memory/speed trade-off; annotated only when in (0, 1].
    pub available_memory_proportion: f32,
    /// Convert the whole program to half precision after lowering.
    pub enable_fp16: bool,
    /// Sync weights to host (and checkpoint) every N steps; 0 disables.
    pub save_per_n_step: u64,
    pub save_path: Option<PathBuf>,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            num_devices: 1,
            is_training: false,
            batches_per_step: 1,
            accumulation_factor: 1,
            replication_factor: 1,
            available_memory_proportion: 0.0,
            enable_fp16: false,
            save_per_n_step: 0,
            save_path: None,
        }
    }
}
