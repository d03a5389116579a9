//! Program assembly for the model device.

use std::path::Path;

use half::f16;
use log::trace;

use npu_lower::attr::AttrMap;
use npu_lower::builder::{ConstantValue, CustomOpIdentifier, ProgramBuilder, TensorId, TensorInfo};
use npu_lower::device::BackendError;
use npu_lower::dtype::DType;
use npu_lower::storage::HostBuffer;

use crate::interp;
use crate::program::{ConstEntry, CustomTarget, ModelNode, ModelProgram, TensorMeta};

/// Assembles a [`ModelProgram`].
///
/// Inputs and weights keep their variable names as tensor ids; op results
/// get minted `t{n}` ids and constants `c{n}`. Shapes are inferred for the
/// op set the interpreter executes; anything else is left unresolved and
/// `tensor_shape` fails for it.
#[derive(Default)]
pub struct ModelBuilder {
    program: ModelProgram,
    next_tensor: u64,
    next_const: u64,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint(&mut self) -> String {
        let id = format!("t{}", self.next_tensor);
        self.next_tensor += 1;
        id
    }

    fn insert_meta(&mut self, id: &str, meta: TensorMeta) {
        self.program.metas.insert(id.to_string(), meta);
    }

    fn meta(&self, id: &str) -> Option<&TensorMeta> {
        self.program.metas.get(id)
    }

    /// Integer payload of a recorded constant, for shape-like operands.
    fn const_i64s(&self, id: &str) -> Option<Vec<i64>> {
        let entry = self.program.constants.iter().find(|e| e.id == id)?;
        let value =
            interp::Value::from_bytes(entry.dtype, entry.shape.clone(), &entry.bytes).ok()?;
        match value.data {
            interp::TensorData::I32(v) => Some(v.into_iter().map(|x| x as i64).collect()),
            interp::TensorData::I64(v) => Some(v),
            interp::TensorData::F32(_) => None,
        }
    }

    fn infer(
        &self,
        op: &str,
        inputs: &[TensorId],
        attrs: &AttrMap,
        num_outputs: usize,
    ) -> Vec<Option<TensorMeta>> {
        let mut out = vec![None; num_outputs];
        if num_outputs == 0 {
            return out;
        }
        out[0] = self.infer_first(op, inputs, attrs);
        out
    }

    fn infer_first(&self, op: &str, inputs: &[TensorId], attrs: &AttrMap) -> Option<TensorMeta> {
        let meta = |i: usize| self.meta(inputs.get(i)?);
        let first = meta(0);
        match op {
            "npu_identity" | "npu_relu" | "npu_tanh" | "npu_log" | "npu_sigmoid" | "npu_sqrt"
            | "npu_gelu" | "npu_softmax" | "npu_printtensor" | "npu_batchnormalization" => {
                first.cloned()
            }
            "npu_cast" => {
                let to = DType::from_tag(attrs.get_int("to").ok()?)?;
                Some(TensorMeta {
                    dtype: to,
                    shape: first?.shape.clone(),
                })
            }
            "npu_add" | "npu_sub" | "npu_mul" | "npu_div" | "npu_pow" => {
                let (a, b) = (first?, meta(1)?);
                let shape = interp::broadcast_shape(&a.shape, &b.shape).ok()?;
                let dtype = if a.dtype == DType::F16 || b.dtype == DType::F16 {
                    DType::F16
                } else {
                    a.dtype
                };
                Some(TensorMeta { dtype, shape })
            }
            "npu_sum" => {
                let mut acc = first?.clone();
                for i in 1..inputs.len() {
                    acc.shape = interp::broadcast_shape(&acc.shape, &meta(i)?.shape).ok()?;
                }
                Some(acc)
            }
            "npu_matmul" | "npu_gemm" => {
                let (a, b) = (first?, meta(1)?);
                if a.shape.len() != 2 || b.shape.len() != 2 {
                    return None;
                }
                let trans_a = attrs.get_int_or("transA", 0) != 0;
                let trans_b = attrs.get_int_or("transB", 0) != 0;
                let m = if trans_a { a.shape[1] } else { a.shape[0] };
                let n = if trans_b { b.shape[0] } else { b.shape[1] };
                Some(TensorMeta {
                    dtype: a.dtype,
                    shape: vec![m, n],
                })
            }
            "npu_reducemean" => {
                let input = first?;
                let rank = input.shape.len();
                let axes: Vec<usize> = match attrs.opt_ints("axes") {
                    Some(axes) => axes
                        .into_iter()
                        .map(|a| interp::normalize_axis(a, rank).ok())
                        .collect::<Option<_>>()?,
                    None => (0..rank).collect(),
                };
                let keepdims = attrs.get_int_or("keepdims", 1) != 0;
                Some(TensorMeta {
                    dtype: input.dtype,
                    shape: interp::reduce_mean_shape(&input.shape, &axes, keepdims),
                })
            }
            "npu_reshape" => {
                let input = first?;
                let spec = self.const_i64s(inputs.get(1)?)?;
                let shape =
                    interp::reshape_dims(interp::numel(&input.shape), &spec, &input.shape).ok()?;
                Some(TensorMeta {
                    dtype: input.dtype,
                    shape,
                })
            }
            "npu_transpose" => {
                let input = first?;
                let perm = attrs.opt_ints("perm")?;
                let shape = perm
                    .iter()
                    .map(|&p| {
                        let p = interp::normalize_axis(p, input.shape.len()).ok()?;
                        Some(input.shape[p])
                    })
                    .collect::<Option<_>>()?;
                Some(TensorMeta {
                    dtype: input.dtype,
                    shape,
                })
            }
            "npu_squeeze" => {
                let input = first?;
                let axes = attrs.opt_ints("axes")?;
                Some(TensorMeta {
                    dtype: input.dtype,
                    shape: interp::squeeze_shape(&input.shape, &axes).ok()?,
                })
            }
            "npu_unsqueeze" => {
                let input = first?;
                let axes = attrs.opt_ints("axes")?;
                Some(TensorMeta {
                    dtype: input.dtype,
                    shape: interp::unsqueeze_shape(&input.shape, &axes).ok()?,
                })
            }
            "npu_concat" => {
                let input = first?;
                let axis = interp::normalize_axis(
                    attrs.get_int_or("axis", 0),
                    input.shape.len(),
                )
                .ok()?;
                let mut shape = input.shape.clone();
                shape[axis] = 0;
                for i in 0..inputs.len() {
                    shape[axis] += meta(i)?.shape.get(axis)?;
                }
                Some(TensorMeta {
                    dtype: input.dtype,
                    shape,
                })
            }
            "npu_slice" => {
                let input = first?;
                let starts = self.const_i64s(inputs.get(1)?)?;
                let ends = self.const_i64s(inputs.get(2)?)?;
                let axes = self.const_i64s(inputs.get(3)?)?;
                let steps = match inputs.get(4) {
                    Some(id) => self.const_i64s(id)?,
                    None => vec![1; axes.len()],
                };
                let bounds =
                    interp::slice_bounds(&input.shape, &starts, &ends, &axes, &steps).ok()?;
                Some(TensorMeta {
                    dtype: input.dtype,
                    shape: bounds
                        .iter()
                        .map(|(s, e, _)| e.saturating_sub(*s) as i64)
                        .collect(),
                })
            }
            "npu_gather" => {
                let (data, idx) = (first?, meta(1)?);
                let axis =
                    interp::normalize_axis(attrs.get_int_or("axis", 0), data.shape.len()).ok()?;
                let mut shape = Vec::new();
                shape.extend_from_slice(&data.shape[..axis]);
                shape.extend_from_slice(&idx.shape);
                shape.extend_from_slice(&data.shape[axis + 1..]);
                Some(TensorMeta {
                    dtype: data.dtype,
                    shape,
                })
            }
            "npu_tile" => {
                let input = first?;
                let repeats = self.const_i64s(inputs.get(1)?)?;
                if repeats.len() != input.shape.len() {
                    return None;
                }
                Some(TensorMeta {
                    dtype: input.dtype,
                    shape: input
                        .shape
                        .iter()
                        .zip(&repeats)
                        .map(|(d, r)| d * r)
                        .collect(),
                })
            }
            "npu_shape" => Some(TensorMeta {
                dtype: DType::I64,
                shape: vec![first?.shape.len() as i64],
            }),
            "npu_nllloss" => Some(TensorMeta {
                dtype: DType::F32,
                shape: vec![],
            }),
            "npu_randomnormal" | "npu_randomuniform" => {
                let shape = attrs.opt_ints("shape")?;
                let dtype = DType::from_tag(attrs.get_int_or("dtype", DType::F32.as_tag()))?;
                Some(TensorMeta { dtype, shape })
            }
            _ => None,
        }
    }

    fn record_node(&mut self, node: ModelNode, metas: Vec<Option<TensorMeta>>) {
        for (id, meta) in node.outputs.iter().zip(metas) {
            if let Some(meta) = meta {
                self.program.metas.insert(id.clone(), meta);
            }
        }
        self.program.nodes.push(node);
    }

    /// Annotates the nodes producing `ids`.
    fn annotate(&mut self, ids: &[TensorId], apply: impl Fn(&mut ModelNode)) {
        for node in &mut self.program.nodes {
            if node.outputs.iter().any(|o| ids.contains(o)) {
                apply(node);
            }
        }
    }
}

fn f32_bytes_to_f16(bytes: &[u8]) -> Vec<u8> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .flat_map(|v| f16::from_f32(v).to_bits().to_ne_bytes())
        .collect()
}

impl ProgramBuilder for ModelBuilder {
    fn add_input(&mut self, info: &TensorInfo, name: &str) -> Result<TensorId, BackendError> {
        if self.program.metas.contains_key(name) {
            return Err(BackendError::spec(format!("input `{name}` declared twice")));
        }
        self.program.inputs.push(name.to_string());
        self.insert_meta(
            name,
            TensorMeta {
                dtype: info.dtype,
                shape: info.shape.clone(),
            },
        );
        Ok(name.to_string())
    }

    fn add_initialized_input(
        &mut self,
        data: &HostBuffer,
        name: &str,
    ) -> Result<TensorId, BackendError> {
        if self.program.metas.contains_key(name) {
            return Err(BackendError::spec(format!("weight `{name}` declared twice")));
        }
        self.program.initializers.push(ConstEntry {
            id: name.to_string(),
            dtype: data.dtype(),
            shape: data.shape().to_vec(),
            bytes: data.bytes().to_vec(),
        });
        self.insert_meta(
            name,
            TensorMeta {
                dtype: data.dtype(),
                shape: data.shape().to_vec(),
            },
        );
        Ok(name.to_string())
    }

    fn add_output(&mut self, id: &TensorId) -> Result<(), BackendError> {
        if !self.program.contains(id) {
            return Err(BackendError::spec(format!("unknown output tensor `{id}`")));
        }
        self.program.outputs.push(id.clone());
        Ok(())
    }

    fn emit(
        &mut self,
        op: &str,
        inputs: &[TensorId],
        attrs: &AttrMap,
        num_outputs: usize,
        debug_id: &str,
    ) -> Result<Vec<TensorId>, BackendError> {
        let outputs: Vec<TensorId> = (0..num_outputs).map(|_| self.mint()).collect();
        let metas = self.infer(op, inputs, attrs, num_outputs);
        trace!("emit {op} ({debug_id}) -> {outputs:?}");
        self.record_node(
            ModelNode {
                op: op.to_string(),
                inputs: inputs.to_vec(),
                outputs: outputs.clone(),
                attrs: attrs.clone(),
                debug_id: debug_id.to_string(),
                custom: None,
                device_index: None,
                pipeline_stage: None,
            },
            metas,
        );
        Ok(outputs)
    }

    fn emit_custom(
        &mut self,
        ident: &CustomOpIdentifier,
        inputs: &[TensorId],
        num_outputs: usize,
        attrs: &AttrMap,
        debug_id: &str,
    ) -> Result<Vec<TensorId>, BackendError> {
        let outputs: Vec<TensorId> = (0..num_outputs).map(|_| self.mint()).collect();
        self.record_node(
            ModelNode {
                op: ident.target_op.clone(),
                inputs: inputs.to_vec(),
                outputs: outputs.clone(),
                attrs: attrs.clone(),
                debug_id: debug_id.to_string(),
                custom: Some(CustomTarget {
                    target_op: ident.target_op.clone(),
                    domain: ident.domain.clone(),
                    version: ident.version,
                }),
                device_index: None,
                pipeline_stage: None,
            },
            vec![None; num_outputs],
        );
        Ok(outputs)
    }

    fn add_constant(
        &mut self,
        value: &ConstantValue,
        dims: &[i64],
        debug_id: &str,
    ) -> Result<TensorId, BackendError> {
        let id = format!("c{}", self.next_const);
        self.next_const += 1;
        let bytes = match value {
            ConstantValue::F16(v) => v
                .iter()
                .flat_map(|x| x.to_bits().to_ne_bytes())
                .collect(),
            ConstantValue::F32(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            ConstantValue::F64(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            ConstantValue::I32(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            ConstantValue::I64(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
        };
        trace!("constant {id} ({debug_id}): {} x {:?}", value.dtype(), dims);
        self.program.constants.push(ConstEntry {
            id: id.clone(),
            dtype: value.dtype(),
            shape: dims.to_vec(),
            bytes,
        });
        self.insert_meta(
            &id,
            TensorMeta {
                dtype: value.dtype(),
                shape: dims.to_vec(),
            },
        );
        Ok(id)
    }

    fn tensor_shape(&self, id: &TensorId) -> Result<Vec<i64>, BackendError> {
        self.meta(id)
            .map(|m| m.shape.clone())
            .ok_or_else(|| BackendError::execution(format!("shape of `{id}` is unresolved")))
    }

    fn virtual_graph(&mut self, ids: &[TensorId], device_index: i64) -> Result<(), BackendError> {
        self.annotate(ids, |node| node.device_index = Some(device_index));
        Ok(())
    }

    fn pipeline_stage(&mut self, ids: &[TensorId], stage: i64) -> Result<(), BackendError> {
        self.annotate(ids, |node| node.pipeline_stage = Some(stage));
        Ok(())
    }

    fn set_available_memory_proportion(
        &mut self,
        ids: &[TensorId],
        proportion: f32,
    ) -> Result<(), BackendError> {
        for id in ids {
            self.program.memory_proportion.insert(id.clone(), proportion);
        }
        Ok(())
    }

    fn set_serialize_matmul(
        &mut self,
        ids: &[TensorId],
        mode: &str,
        factor: i64,
    ) -> Result<(), BackendError> {
        for id in ids {
            self.program
                .serialization
                .insert(id.clone(), (mode.to_string(), factor));
        }
        Ok(())
    }

    fn convert_floats_to_halfs(&mut self) -> Result<(), BackendError> {
        for entry in self
            .program
            .initializers
            .iter_mut()
            .chain(self.program.constants.iter_mut())
        {
            if entry.dtype == DType::F32 {
                entry.bytes = f32_bytes_to_f16(&entry.bytes);
                entry.dtype = DType::F16;
            }
        }
        for meta in self.program.metas.values_mut() {
            if meta.dtype == DType::F32 {
                meta.dtype = DType::F16;
            }
        }
        self.program.fp16 = true;
        Ok(())
    }

    fn model_blob(&self) -> Result<Vec<u8>, BackendError> {
        self.program.to_blob()
    }

    fn save_model(&self, path: &Path) -> Result<(), BackendError> {
        let blob = self.program.to_blob()?;
        std::fs::write(path, blob)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_keep_their_names() {
        let mut builder = ModelBuilder::new();
        let id = builder
            .add_input(&TensorInfo::new(DType::F32, vec![2, 2]), "x")
            .unwrap();
        assert_eq!(id, "x");
        assert_eq!(builder.tensor_shape(&id).unwrap(), vec![2, 2]);
    }

    #[test]
    fn emit_infers_broadcast_shape() {
        let mut builder = ModelBuilder::new();
        let a = builder
            .add_input(&TensorInfo::new(DType::F32, vec![2, 3]), "a")
            .unwrap();
        let b = builder
            .add_input(&TensorInfo::new(DType::F32, vec![3]), "b")
            .unwrap();
        let out = builder
            .emit("npu_add", &[a, b], &AttrMap::new(), 1, "add")
            .unwrap();
        assert_eq!(builder.tensor_shape(&out[0]).unwrap(), vec![2, 3]);
    }

    #[test]
    fn reshape_shape_comes_from_constant() {
        let mut builder = ModelBuilder::new();
        let x = builder
            .add_input(&TensorInfo::new(DType::F32, vec![2, 3]), "x")
            .unwrap();
        let shape = builder
            .add_constant(&ConstantValue::I64(vec![3, 2]), &[2], "shape")
            .unwrap();
        let out = builder
            .emit("npu_reshape", &[x, shape], &AttrMap::new(), 1, "reshape")
            .unwrap();
        assert_eq!(builder.tensor_shape(&out[0]).unwrap(), vec![3, 2]);
    }

    #[test]
    fn fp16_conversion_rewrites_weights() {
        let mut builder = ModelBuilder::new();
        builder
            .add_initialized_input(&HostBuffer::from_f32(vec![2], &[1.0, 2.0]), "w")
            .unwrap();
        builder.convert_floats_to_halfs().unwrap();
        let program = ModelProgram::from_blob(&builder.model_blob().unwrap()).unwrap();
        assert!(program.fp16);
        assert_eq!(program.initializers[0].dtype, DType::F16);
        assert_eq!(program.initializers[0].bytes.len(), 4);
    }
}
