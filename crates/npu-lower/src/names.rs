//! Attribute keys and naming conventions shared across the bridge.

/// Prefix of every operator in the normalized vocabulary.
pub const NORMALIZED_PREFIX: &str = "npu_";

/// Prefix of variable names minted by the canonicalization builder.
pub const GENERATED_PREFIX: &str = "_npu_gen_";

/// Device placement index, annotated on ops before lowering.
pub const DEVICE_INDEX_ATTR: &str = "__device_index";

/// Pipeline stage, only honored when a device index is also present.
pub const PIPELINE_STAGE_ATTR: &str = "__pipeline_stage";

/// Stable per-op debug identifier carried into the lowered program.
pub const OP_IDENT_ATTR: &str = "__op_id";

/// Source operator type recorded by the custom-op handler.
pub const OP_TYPE_ATTR: &str = "__op_type";

/// Matmul serialization factor; presence turns serialization on.
pub const SERIALIZE_FACTOR_ATTR: &str = "__serialize_factor";

/// Matmul serialization mode, defaults to `output_channels`.
pub const SERIALIZE_MODE_ATTR: &str = "__serialize_mode";

/// Default matmul serialization mode.
pub const SERIALIZE_MODE_DEFAULT: &str = "output_channels";

/// Attribute carrying the scheduling role of a front-end op.
pub const OP_ROLE_ATTR: &str = "op_role";

/// Role value marking optimizer update ops.
pub const OP_ROLE_OPTIMIZE: i64 = 2;
