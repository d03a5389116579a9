//! Data-driven description of the normalized operator vocabulary.
//!
//! Each entry names the attributes the lowering engine forwards to the
//! builder for that op, with their expected value family. Everything not
//! listed (placement markers and the like) stays behind.

use crate::attr::{AttrError, AttrMap, AttrValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Int,
    Ints,
    Int32s,
    Float,
    Floats,
    Doubles,
    Str,
}

impl AttrKind {
    fn matches(self, value: &AttrValue) -> bool {
        matches!(
            (self, value),
            (AttrKind::Int, AttrValue::Int(_))
                | (AttrKind::Ints, AttrValue::Ints(_))
                | (AttrKind::Int32s, AttrValue::Int32s(_))
                | (AttrKind::Float, AttrValue::Float(_))
                | (AttrKind::Floats, AttrValue::Floats(_))
                | (AttrKind::Doubles, AttrValue::Doubles(_))
                | (AttrKind::Str, AttrValue::Str(_))
        )
    }

    fn name(self) -> &'static str {
        match self {
            AttrKind::Int => "int",
            AttrKind::Ints => "ints",
            AttrKind::Int32s => "int32s",
            AttrKind::Float => "float",
            AttrKind::Floats => "floats",
            AttrKind::Doubles => "doubles",
            AttrKind::Str => "str",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttrSpec {
    pub name: &'static str,
    pub kind: AttrKind,
    pub required: bool,
}

const fn req(name: &'static str, kind: AttrKind) -> AttrSpec {
    AttrSpec {
        name,
        kind,
        required: true,
    }
}

const fn opt(name: &'static str, kind: AttrKind) -> AttrSpec {
    AttrSpec {
        name,
        kind,
        required: false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpSchema {
    pub name: &'static str,
    pub attrs: &'static [AttrSpec],
}

/// The operator table. `npu_constant` and `npu_custom_op` are lowered by
/// dedicated paths and do not appear here.
pub const OP_SCHEMAS: &[OpSchema] = &[
    OpSchema { name: "npu_add", attrs: &[] },
    OpSchema { name: "npu_sub", attrs: &[] },
    OpSchema { name: "npu_mul", attrs: &[] },
    OpSchema { name: "npu_div", attrs: &[] },
    OpSchema { name: "npu_pow", attrs: &[] },
    OpSchema { name: "npu_sum", attrs: &[] },
    OpSchema { name: "npu_identity", attrs: &[] },
    OpSchema { name: "npu_matmul", attrs: &[] },
    OpSchema {
        name: "npu_gemm",
        attrs: &[
            req("alpha", AttrKind::Float),
            req("beta", AttrKind::Float),
            req("transA", AttrKind::Int),
            req("transB", AttrKind::Int),
        ],
    },
    OpSchema {
        name: "npu_softmax",
        attrs: &[req("axis", AttrKind::Int)],
    },
    OpSchema {
        name: "npu_reducemean",
        attrs: &[opt("axes", AttrKind::Ints), req("keepdims", AttrKind::Int)],
    },
    OpSchema {
        name: "npu_cast",
        attrs: &[req("to", AttrKind::Int)],
    },
    OpSchema {
        name: "npu_conv",
        attrs: &[
            req("dilations", AttrKind::Ints),
            req("group", AttrKind::Int),
            opt("kernel_shape", AttrKind::Ints),
            req("pads", AttrKind::Ints),
            req("strides", AttrKind::Ints),
        ],
    },
    OpSchema {
        name: "npu_maxpool",
        attrs: &[
            req("num_outputs", AttrKind::Int),
            req("kernel_shape", AttrKind::Ints),
            req("ceil_mode", AttrKind::Int),
            req("dilations", AttrKind::Ints),
            req("pads", AttrKind::Ints),
            req("storage_order", AttrKind::Int),
            req("strides", AttrKind::Ints),
        ],
    },
    OpSchema {
        name: "npu_averagepool",
        attrs: &[
            req("kernel_shape", AttrKind::Ints),
            req("ceil_mode", AttrKind::Int),
            req("count_include_pad", AttrKind::Int),
            req("pads", AttrKind::Ints),
            req("strides", AttrKind::Ints),
        ],
    },
    OpSchema { name: "npu_globalmaxpool", attrs: &[] },
    OpSchema { name: "npu_globalaveragepool", attrs: &[] },
    OpSchema {
        name: "npu_batchnormalization",
        attrs: &[
            req("momentum", AttrKind::Float),
            req("epsilon", AttrKind::Float),
            req("num_outputs", AttrKind::Int),
        ],
    },
    OpSchema {
        name: "npu_groupnormalization",
        attrs: &[req("epsilon", AttrKind::Float), req("num_groups", AttrKind::Int)],
    },
    OpSchema {
        name: "npu_instancenormalization",
        attrs: &[req("epsilon", AttrKind::Float)],
    },
    OpSchema {
        name: "npu_nllloss",
        attrs: &[req("ignoreIndex", AttrKind::Int)],
    },
    OpSchema {
        name: "npu_squeeze",
        attrs: &[req("axes", AttrKind::Ints)],
    },
    OpSchema {
        name: "npu_unsqueeze",
        attrs: &[req("axes", AttrKind::Ints)],
    },
    OpSchema {
        name: "npu_concat",
        attrs: &[req("axis", AttrKind::Int)],
    },
    OpSchema {
        name: "npu_transpose",
        attrs: &[req("perm", AttrKind::Ints)],
    },
    OpSchema { name: "npu_reshape", attrs: &[] },
    OpSchema { name: "npu_slice", attrs: &[] },
    OpSchema { name: "npu_gather", attrs: &[] },
    OpSchema { name: "npu_tile", attrs: &[] },
    OpSchema { name: "npu_shape", attrs: &[] },
    OpSchema { name: "npu_relu", attrs: &[] },
    OpSchema { name: "npu_tanh", attrs: &[] },
    OpSchema { name: "npu_log", attrs: &[] },
    OpSchema { name: "npu_sigmoid", attrs: &[] },
    OpSchema { name: "npu_sqrt", attrs: &[] },
    OpSchema { name: "npu_gelu", attrs: &[] },
    OpSchema {
        name: "npu_randomnormal",
        attrs: &[
            req("shape", AttrKind::Ints),
            req("dtype", AttrKind::Int),
            req("mean", AttrKind::Float),
            req("scale", AttrKind::Float),
            req("seed", AttrKind::Float),
        ],
    },
    OpSchema {
        name: "npu_randomuniform",
        attrs: &[
            req("shape", AttrKind::Ints),
            req("dtype", AttrKind::Int),
            req("high", AttrKind::Float),
            req("low", AttrKind::Float),
            req("seed", AttrKind::Float),
        ],
    },
    OpSchema {
        name: "npu_printtensor",
        attrs: &[req("print_gradient", AttrKind::Int), req("title", AttrKind::Str)],
    },
];

pub fn find_schema(name: &str) -> Option<&'static OpSchema> {
    OP_SCHEMAS.iter().find(|s| s.name == name)
}

/// Projects the attrs an op forwards to the builder, validating value
/// families against the schema.
pub fn project_attrs(schema: &OpSchema, attrs: &AttrMap) -> Result<AttrMap, AttrError> {
    let mut out = AttrMap::new();
    for spec in schema.attrs {
        match attrs.get(spec.name) {
            Some(value) if spec.kind.matches(value) => out.insert(spec.name, value.clone()),
            Some(_) => {
                return Err(AttrError::WrongType {
                    name: spec.name.to_string(),
                    expected: spec.kind.name(),
                })
            }
            None if spec.required => return Err(AttrError::Missing(spec.name.to_string())),
            None => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_no_duplicates() {
        for (i, a) in OP_SCHEMAS.iter().enumerate() {
            for b in &OP_SCHEMAS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn projection_filters_markers() {
        let schema = find_schema("npu_softmax").unwrap();
        let attrs = AttrMap::new().with("axis", 1i64).with("__device_index", 0i64);
        let projected = project_attrs(schema, &attrs).unwrap();
        assert_eq!(projected.len(), 1);
        assert_eq!(projected.get_int("axis").unwrap(), 1);
    }

    #[test]
    fn projection_requires_declared_attrs() {
        let schema = find_schema("npu_softmax").unwrap();
        assert!(project_attrs(schema, &AttrMap::new()).is_err());
    }
}
