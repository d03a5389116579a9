//! Interpreter for the model device.
//!
//! Compute happens in float32; half precision is a storage format that is
//! widened on load and narrowed on store. Integer tensors are carried for
//! index and shape operands.

use std::collections::HashMap;

use half::f16;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use npu_lower::attr::AttrMap;
use npu_lower::device::BackendError;
use npu_lower::dtype::DType;

use crate::program::ModelNode;

/// Runtime tensor payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

/// A materialized tensor. `dtype` is the logical wire type; float16 and
/// float64 payloads live in the `F32` variant.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub dtype: DType,
    pub shape: Vec<i64>,
    pub data: TensorData,
}

pub fn numel(shape: &[i64]) -> usize {
    shape.iter().product::<i64>().max(0) as usize
}

impl Value {
    pub fn from_f32(shape: Vec<i64>, values: Vec<f32>) -> Self {
        Self {
            dtype: DType::F32,
            shape,
            data: TensorData::F32(values),
        }
    }

    pub fn from_i64(shape: Vec<i64>, values: Vec<i64>) -> Self {
        Self {
            dtype: DType::I64,
            shape,
            data: TensorData::I64(values),
        }
    }

    /// Decodes raw bytes in the given wire dtype.
    pub fn from_bytes(dtype: DType, shape: Vec<i64>, bytes: &[u8]) -> Result<Self, BackendError> {
        let data = match dtype {
            DType::F32 => TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::F16 => TensorData::F32(
                bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_bits(u16::from_ne_bytes([c[0], c[1]])).to_f32())
                    .collect(),
            ),
            DType::F64 => TensorData::F32(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        f64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                    })
                    .collect(),
            ),
            DType::I32 => TensorData::I32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::I64 => TensorData::I64(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        i64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                    })
                    .collect(),
            ),
            other => {
                return Err(BackendError::unimplemented(format!(
                    "model device cannot hold {other} tensors"
                )))
            }
        };
        Ok(Self { dtype, shape, data })
    }

    /// Encodes the payload in a requested wire dtype.
    pub fn to_bytes_as(&self, dtype: DType) -> Result<Vec<u8>, BackendError> {
        let bytes = match (&self.data, dtype) {
            (TensorData::F32(v), DType::F32) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            (TensorData::F32(v), DType::F16) => v
                .iter()
                .flat_map(|x| f16::from_f32(*x).to_bits().to_ne_bytes())
                .collect(),
            (TensorData::F32(v), DType::F64) => v
                .iter()
                .flat_map(|x| (*x as f64).to_ne_bytes())
                .collect(),
            (TensorData::I32(v), DType::I32) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            (TensorData::I32(v), DType::I64) => v
                .iter()
                .flat_map(|x| (*x as i64).to_ne_bytes())
                .collect(),
            (TensorData::I64(v), DType::I64) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            (TensorData::I64(v), DType::I32) => v
                .iter()
                .flat_map(|x| (*x as i32).to_ne_bytes())
                .collect(),
            (_, other) => {
                return Err(BackendError::execution(format!(
                    "cannot encode tensor as {other}"
                )))
            }
        };
        Ok(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BackendError> {
        self.to_bytes_as(self.dtype)
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    fn f32s(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(v) => v.clone(),
            TensorData::I32(v) => v.iter().map(|x| *x as f32).collect(),
            TensorData::I64(v) => v.iter().map(|x| *x as f32).collect(),
        }
    }

    /// Integer view for shape-like operands.
    fn i64s(&self) -> Result<Vec<i64>, BackendError> {
        match &self.data {
            TensorData::I32(v) => Ok(v.iter().map(|x| *x as i64).collect()),
            TensorData::I64(v) => Ok(v.clone()),
            TensorData::F32(_) => Err(BackendError::execution(
                "expected an integer tensor operand",
            )),
        }
    }

    fn is_int(&self) -> bool {
        matches!(self.data, TensorData::I32(_) | TensorData::I64(_))
    }
}

fn strides(shape: &[i64]) -> Vec<usize> {
    let mut out = vec![1usize; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        out[i] = out[i + 1] * shape[i + 1].max(0) as usize;
    }
    out
}

fn coords(mut idx: usize, shape: &[i64]) -> Vec<usize> {
    let st = strides(shape);
    shape
        .iter()
        .zip(st)
        .map(|(_, s)| {
            let c = idx / s;
            idx %= s;
            c
        })
        .collect()
}

pub(crate) fn broadcast_shape(a: &[i64], b: &[i64]) -> Result<Vec<i64>, BackendError> {
    let rank = a.len().max(b.len());
    let dim = |s: &[i64], i: usize| {
        if i + s.len() >= rank {
            s[i + s.len() - rank]
        } else {
            1
        }
    };
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let (da, db) = (dim(a, i), dim(b, i));
        if da != db && da != 1 && db != 1 {
            return Err(BackendError::execution(format!(
                "cannot broadcast shapes {a:?} and {b:?}"
            )));
        }
        out.push(da.max(db));
    }
    Ok(out)
}

pub(crate) fn normalize_axis(axis: i64, rank: usize) -> Result<usize, BackendError> {
    let rank = rank as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    if axis < 0 || axis >= rank.max(1) {
        return Err(BackendError::execution(format!("axis {axis} out of range")));
    }
    Ok(axis as usize)
}

/// Offset of `out_coords` projected into a (possibly broadcast) input.
fn project_offset(out_coords: &[usize], in_shape: &[i64]) -> usize {
    let st = strides(in_shape);
    let skip = out_coords.len() - in_shape.len();
    in_shape
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            let c = if d == 1 { 0 } else { out_coords[skip + i] };
            c * st[i]
        })
        .sum()
}

fn result_float_dtype(a: &Value, b: &Value) -> DType {
    if a.dtype == DType::F16 || b.dtype == DType::F16 {
        DType::F16
    } else {
        DType::F32
    }
}

fn binary_f32(a: &Value, b: &Value, f: impl Fn(f32, f32) -> f32) -> Result<Value, BackendError> {
    let shape = broadcast_shape(&a.shape, &b.shape)?;
    let (av, bv) = (a.f32s(), b.f32s());
    let mut out = Vec::with_capacity(numel(&shape));
    for idx in 0..numel(&shape) {
        let c = coords(idx, &shape);
        out.push(f(av[project_offset(&c, &a.shape)], bv[project_offset(&c, &b.shape)]));
    }
    Ok(Value {
        dtype: result_float_dtype(a, b),
        shape,
        data: TensorData::F32(out),
    })
}

fn binary_i64(a: &Value, b: &Value, f: impl Fn(i64, i64) -> i64) -> Result<Value, BackendError> {
    let shape = broadcast_shape(&a.shape, &b.shape)?;
    let (av, bv) = (a.i64s()?, b.i64s()?);
    let mut out = Vec::with_capacity(numel(&shape));
    for idx in 0..numel(&shape) {
        let c = coords(idx, &shape);
        out.push(f(av[project_offset(&c, &a.shape)], bv[project_offset(&c, &b.shape)]));
    }
    Ok(Value {
        dtype: DType::I64,
        shape,
        data: TensorData::I64(out),
    })
}

fn elementwise(a: &Value, b: &Value, op: &str) -> Result<Value, BackendError> {
    if a.is_int() && b.is_int() && op != "pow" {
        return binary_i64(a, b, |x, y| match op {
            "add" => x + y,
            "sub" => x - y,
            "mul" => x * y,
            _ => if y == 0 { 0 } else { x / y },
        });
    }
    binary_f32(a, b, |x, y| match op {
        "add" => x + y,
        "sub" => x - y,
        "mul" => x * y,
        "div" => x / y,
        _ => x.powf(y),
    })
}

fn unary(input: &Value, f: impl Fn(f32) -> f32) -> Value {
    Value {
        dtype: if input.dtype == DType::F16 {
            DType::F16
        } else {
            DType::F32
        },
        shape: input.shape.clone(),
        data: TensorData::F32(input.f32s().into_iter().map(f).collect()),
    }
}

fn dims2(v: &Value) -> Result<(usize, usize), BackendError> {
    if v.shape.len() != 2 {
        return Err(BackendError::unimplemented(format!(
            "model device matmul requires rank-2 operands, found {:?}",
            v.shape
        )));
    }
    Ok((v.shape[0] as usize, v.shape[1] as usize))
}

fn matmul2(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for p in 0..k {
            let lhs = a[i * k + p];
            for j in 0..n {
                out[i * n + j] += lhs * b[p * n + j];
            }
        }
    }
    out
}

fn transpose2(v: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; v.len()];
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = v[i * cols + j];
        }
    }
    out
}

fn gemm(inputs: &[&Value], attrs: &AttrMap) -> Result<Value, BackendError> {
    let alpha = attrs.get_float("alpha").unwrap_or(1.0);
    let beta = attrs.get_float("beta").unwrap_or(1.0);
    let trans_a = attrs.get_int_or("transA", 0) != 0;
    let trans_b = attrs.get_int_or("transB", 0) != 0;

    let (mut a, mut b) = (inputs[0].f32s(), inputs[1].f32s());
    let (ra, ca) = dims2(inputs[0])?;
    let (rb, cb) = dims2(inputs[1])?;
    let (m, k) = if trans_a { (ca, ra) } else { (ra, ca) };
    let (kb, n) = if trans_b { (cb, rb) } else { (rb, cb) };
    if k != kb {
        return Err(BackendError::execution(format!(
            "matmul inner dims disagree, {k} vs {kb}"
        )));
    }
    if trans_a {
        a = transpose2(&a, ra, ca);
    }
    if trans_b {
        b = transpose2(&b, rb, cb);
    }
    let mut out = matmul2(&a, &b, m, k, n);
    for v in &mut out {
        *v *= alpha;
    }
    let mut result = Value {
        dtype: result_float_dtype(inputs[0], inputs[1]),
        shape: vec![m as i64, n as i64],
        data: TensorData::F32(out),
    };
    if let Some(c) = inputs.get(2) {
        let scaled = unary(c, |x| x * beta);
        result = binary_f32(&result, &scaled, |x, y| x + y)?;
        result.dtype = result_float_dtype(inputs[0], inputs[1]);
    }
    Ok(result)
}

fn softmax(input: &Value, axis: i64) -> Result<Value, BackendError> {
    let axis = normalize_axis(axis, input.shape.len())?;
    let values = input.f32s();
    let axis_len = input.shape[axis].max(0) as usize;
    let inner: usize = input.shape[axis + 1..].iter().product::<i64>().max(0) as usize;
    let outer: usize = input.shape[..axis].iter().product::<i64>().max(0) as usize;
    let mut out = vec![0.0f32; values.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| o * axis_len * inner + j * inner + i;
            let max = (0..axis_len)
                .map(|j| values[at(j)])
                .fold(f32::NEG_INFINITY, f32::max);
            let total: f32 = (0..axis_len).map(|j| (values[at(j)] - max).exp()).sum();
            for j in 0..axis_len {
                out[at(j)] = (values[at(j)] - max).exp() / total;
            }
        }
    }
    Ok(Value {
        dtype: input.dtype,
        shape: input.shape.clone(),
        data: TensorData::F32(out),
    })
}

pub(crate) fn reduce_mean_shape(shape: &[i64], axes: &[usize], keepdims: bool) -> Vec<i64> {
    let mut out = Vec::new();
    for (i, &d) in shape.iter().enumerate() {
        if axes.contains(&i) {
            if keepdims {
                out.push(1);
            }
        } else {
            out.push(d);
        }
    }
    out
}

fn reduce_mean(input: &Value, attrs: &AttrMap) -> Result<Value, BackendError> {
    let rank = input.shape.len();
    let axes: Vec<usize> = match attrs.opt_ints("axes") {
        Some(axes) => axes
            .into_iter()
            .map(|a| normalize_axis(a, rank))
            .collect::<Result<_, _>>()?,
        None => (0..rank).collect(),
    };
    let keepdims = attrs.get_int_or("keepdims", 1) != 0;
    let out_shape = reduce_mean_shape(&input.shape, &axes, keepdims);

    let values = input.f32s();
    let kept: Vec<usize> = (0..rank).filter(|i| !axes.contains(i)).collect();
    let kept_shape: Vec<i64> = kept.iter().map(|&i| input.shape[i]).collect();
    let mut sums = vec![0.0f32; numel(&kept_shape).max(1)];
    let kept_strides = strides(&kept_shape);
    for (idx, v) in values.iter().enumerate() {
        let c = coords(idx, &input.shape);
        let slot: usize = kept
            .iter()
            .enumerate()
            .map(|(pos, &dim)| c[dim] * kept_strides[pos])
            .sum();
        sums[slot] += v;
    }
    let count = (values.len() / sums.len().max(1)).max(1) as f32;
    for s in &mut sums {
        *s /= count;
    }
    Ok(Value {
        dtype: input.dtype,
        shape: out_shape,
        data: TensorData::F32(sums),
    })
}

fn cast(input: &Value, to: DType) -> Result<Value, BackendError> {
    let data = match to {
        DType::F32 | DType::F16 | DType::F64 => TensorData::F32(input.f32s()),
        DType::I32 => TensorData::I32(match &input.data {
            TensorData::F32(v) => v.iter().map(|x| *x as i32).collect(),
            TensorData::I32(v) => v.clone(),
            TensorData::I64(v) => v.iter().map(|x| *x as i32).collect(),
        }),
        DType::I64 => TensorData::I64(match &input.data {
            TensorData::F32(v) => v.iter().map(|x| *x as i64).collect(),
            TensorData::I32(v) => v.iter().map(|x| *x as i64).collect(),
            TensorData::I64(v) => v.clone(),
        }),
        other => {
            return Err(BackendError::unimplemented(format!(
                "model device cannot cast to {other}"
            )))
        }
    };
    Ok(Value {
        dtype: to,
        shape: input.shape.clone(),
        data,
    })
}

pub(crate) fn reshape_dims(input_numel: usize, spec: &[i64], input_shape: &[i64]) -> Result<Vec<i64>, BackendError> {
    let mut out: Vec<i64> = Vec::with_capacity(spec.len());
    let mut infer = None;
    for (i, &d) in spec.iter().enumerate() {
        match d {
            -1 if infer.is_none() => {
                infer = Some(i);
                out.push(1);
            }
            -1 => return Err(BackendError::execution("reshape has two inferred dims")),
            0 => out.push(*input_shape.get(i).unwrap_or(&0)),
            d => out.push(d),
        }
    }
    if let Some(i) = infer {
        let known = numel(&out).max(1);
        out[i] = (input_numel / known) as i64;
    }
    if numel(&out) != input_numel {
        return Err(BackendError::execution(format!(
            "cannot reshape {input_numel} elements to {out:?}"
        )));
    }
    Ok(out)
}

fn transpose(input: &Value, perm: &[i64]) -> Result<Value, BackendError> {
    let rank = input.shape.len();
    if perm.len() != rank {
        return Err(BackendError::execution("transpose perm rank mismatch"));
    }
    let perm: Vec<usize> = perm
        .iter()
        .map(|&p| normalize_axis(p, rank))
        .collect::<Result<_, _>>()?;
    let out_shape: Vec<i64> = perm.iter().map(|&p| input.shape[p]).collect();
    let in_strides = strides(&input.shape);
    let indices: Vec<usize> = (0..input.numel())
        .map(|idx| {
            let c = coords(idx, &out_shape);
            perm.iter()
                .enumerate()
                .map(|(i, &p)| c[i] * in_strides[p])
                .sum()
        })
        .collect();
    let data = match &input.data {
        TensorData::F32(v) => TensorData::F32(indices.iter().map(|&i| v[i]).collect()),
        TensorData::I32(v) => TensorData::I32(indices.iter().map(|&i| v[i]).collect()),
        TensorData::I64(v) => TensorData::I64(indices.iter().map(|&i| v[i]).collect()),
    };
    Ok(Value {
        dtype: input.dtype,
        shape: out_shape,
        data,
    })
}

pub(crate) fn squeeze_shape(shape: &[i64], axes: &[i64]) -> Result<Vec<i64>, BackendError> {
    let rank = shape.len();
    let axes: Vec<usize> = axes
        .iter()
        .map(|&a| normalize_axis(a, rank))
        .collect::<Result<_, _>>()?;
    let mut out = Vec::new();
    for (i, &d) in shape.iter().enumerate() {
        if axes.contains(&i) {
            if d != 1 {
                return Err(BackendError::execution(format!(
                    "cannot squeeze dim {i} of extent {d}"
                )));
            }
        } else {
            out.push(d);
        }
    }
    Ok(out)
}

pub(crate) fn unsqueeze_shape(shape: &[i64], axes: &[i64]) -> Result<Vec<i64>, BackendError> {
    let out_rank = shape.len() + axes.len();
    let mut axes: Vec<usize> = axes
        .iter()
        .map(|&a| normalize_axis(a, out_rank))
        .collect::<Result<_, _>>()?;
    axes.sort_unstable();
    let mut out = shape.to_vec();
    for &a in &axes {
        out.insert(a.min(out.len()), 1);
    }
    Ok(out)
}

fn concat(inputs: &[&Value], axis: i64) -> Result<Value, BackendError> {
    let first = inputs
        .first()
        .ok_or_else(|| BackendError::execution("concat of zero tensors"))?;
    let rank = first.shape.len();
    let axis = normalize_axis(axis, rank)?;
    let mut out_shape = first.shape.clone();
    out_shape[axis] = inputs.iter().map(|v| v.shape[axis]).sum();

    let outer: usize = first.shape[..axis].iter().product::<i64>().max(0) as usize;
    let inner: usize = first.shape[axis + 1..].iter().product::<i64>().max(0) as usize;
    let int = first.is_int();
    let mut floats = Vec::new();
    let mut ints = Vec::new();
    for o in 0..outer.max(1) {
        for v in inputs {
            let chunk = v.shape[axis].max(0) as usize * inner;
            if int {
                ints.extend_from_slice(&v.i64s()?[o * chunk..(o + 1) * chunk]);
            } else {
                floats.extend_from_slice(&v.f32s()[o * chunk..(o + 1) * chunk]);
            }
        }
    }
    Ok(Value {
        dtype: first.dtype,
        shape: out_shape,
        data: if int {
            TensorData::I64(ints)
        } else {
            TensorData::F32(floats)
        },
    })
}

pub(crate) fn slice_bounds(
    shape: &[i64],
    starts: &[i64],
    ends: &[i64],
    axes: &[i64],
    steps: &[i64],
) -> Result<Vec<(usize, usize, usize)>, BackendError> {
    // One (start, end, step) triple per dim, defaulting to the full range.
    let rank = shape.len();
    let mut bounds: Vec<(usize, usize, usize)> =
        shape.iter().map(|&d| (0, d.max(0) as usize, 1)).collect();
    for (i, &axis) in axes.iter().enumerate() {
        let axis = normalize_axis(axis, rank)?;
        let dim = shape[axis];
        let clamp = |v: i64| -> usize {
            let v = if v < 0 { v + dim } else { v };
            v.clamp(0, dim) as usize
        };
        let step = *steps.get(i).unwrap_or(&1);
        if step != 1 {
            return Err(BackendError::unimplemented("slice step must be 1"));
        }
        bounds[axis] = (clamp(starts[i]), clamp(ends[i]), 1);
    }
    Ok(bounds)
}

fn slice(inputs: &[&Value]) -> Result<Value, BackendError> {
    let data = inputs[0];
    let starts = inputs[1].i64s()?;
    let ends = inputs[2].i64s()?;
    let axes = inputs[3].i64s()?;
    let steps = match inputs.get(4) {
        Some(v) => v.i64s()?,
        None => vec![1; axes.len()],
    };
    let bounds = slice_bounds(&data.shape, &starts, &ends, &axes, &steps)?;
    let out_shape: Vec<i64> = bounds
        .iter()
        .map(|(s, e, _)| e.saturating_sub(*s) as i64)
        .collect();
    let in_strides = strides(&data.shape);
    let indices: Vec<usize> = (0..numel(&out_shape))
        .map(|idx| {
            let c = coords(idx, &out_shape);
            c.iter()
                .zip(&bounds)
                .zip(&in_strides)
                .map(|((coord, (s, _, _)), stride)| (coord + s) * stride)
                .sum()
        })
        .collect();
    let payload = match &data.data {
        TensorData::F32(v) => TensorData::F32(indices.iter().map(|&i| v[i]).collect()),
        TensorData::I32(v) => TensorData::I32(indices.iter().map(|&i| v[i]).collect()),
        TensorData::I64(v) => TensorData::I64(indices.iter().map(|&i| v[i]).collect()),
    };
    Ok(Value {
        dtype: data.dtype,
        shape: out_shape,
        data: payload,
    })
}

fn gather(data: &Value, indices: &Value, axis: i64) -> Result<Value, BackendError> {
    let rank = data.shape.len();
    let axis = normalize_axis(axis, rank)?;
    let idx = indices.i64s()?;
    let dim = data.shape[axis];
    let mut out_shape = Vec::new();
    out_shape.extend_from_slice(&data.shape[..axis]);
    out_shape.extend_from_slice(&indices.shape);
    out_shape.extend_from_slice(&data.shape[axis + 1..]);

    let outer: usize = data.shape[..axis].iter().product::<i64>().max(0) as usize;
    let inner: usize = data.shape[axis + 1..].iter().product::<i64>().max(0) as usize;
    let mut positions = Vec::with_capacity(numel(&out_shape));
    for o in 0..outer.max(1) {
        for &i in &idx {
            let i = if i < 0 { i + dim } else { i };
            if i < 0 || i >= dim {
                return Err(BackendError::execution(format!(
                    "gather index {i} out of range for dim {dim}"
                )));
            }
            let base = o * dim.max(0) as usize * inner + i as usize * inner;
            positions.extend(base..base + inner);
        }
    }
    let payload = match &data.data {
        TensorData::F32(v) => TensorData::F32(positions.iter().map(|&i| v[i]).collect()),
        TensorData::I32(v) => TensorData::I32(positions.iter().map(|&i| v[i]).collect()),
        TensorData::I64(v) => TensorData::I64(positions.iter().map(|&i| v[i]).collect()),
    };
    Ok(Value {
        dtype: data.dtype,
        shape: out_shape,
        data: payload,
    })
}

fn tile(data: &Value, repeats: &[i64]) -> Result<Value, BackendError> {
    if repeats.len() != data.shape.len() {
        return Err(BackendError::execution("tile repeats rank mismatch"));
    }
    let out_shape: Vec<i64> = data
        .shape
        .iter()
        .zip(repeats)
        .map(|(d, r)| d * r)
        .collect();
    let in_strides = strides(&data.shape);
    let indices: Vec<usize> = (0..numel(&out_shape))
        .map(|idx| {
            let c = coords(idx, &out_shape);
            c.iter()
                .zip(&data.shape)
                .zip(&in_strides)
                .map(|((coord, &d), stride)| (coord % d.max(1) as usize) * stride)
                .sum()
        })
        .collect();
    let payload = match &data.data {
        TensorData::F32(v) => TensorData::F32(indices.iter().map(|&i| v[i]).collect()),
        TensorData::I32(v) => TensorData::I32(indices.iter().map(|&i| v[i]).collect()),
        TensorData::I64(v) => TensorData::I64(indices.iter().map(|&i| v[i]).collect()),
    };
    Ok(Value {
        dtype: data.dtype,
        shape: out_shape,
        data: payload,
    })
}

fn nll_loss(probs: &Value, target: &Value, ignore_index: i64) -> Result<Value, BackendError> {
    if probs.shape.len() != 2 {
        return Err(BackendError::unimplemented(
            "model device nllloss requires a rank-2 probability tensor",
        ));
    }
    let (n, c) = (probs.shape[0] as usize, probs.shape[1] as usize);
    let p = probs.f32s();
    let t = target.i64s()?;
    let mut total = 0.0f32;
    let mut count = 0usize;
    for (i, &label) in t.iter().enumerate().take(n) {
        if label == ignore_index {
            continue;
        }
        let idx = i * c + label as usize;
        total -= p[idx].max(f32::MIN_POSITIVE).ln();
        count += 1;
    }
    let loss = if count == 0 { 0.0 } else { total / count as f32 };
    Ok(Value {
        dtype: DType::F32,
        shape: vec![],
        data: TensorData::F32(vec![loss]),
    })
}

fn random(attrs: &AttrMap, normal: bool) -> Result<Value, BackendError> {
    let shape = attrs.get_ints("shape").map_err(wrap_attr)?;
    let seed = attrs.get_float("seed").unwrap_or(0.0) as u64;
    let mut rng = StdRng::seed_from_u64(seed);
    let count = numel(&shape);
    let values: Vec<f32> = if normal {
        let mean = attrs.get_float("mean").unwrap_or(0.0);
        let scale = attrs.get_float("scale").unwrap_or(1.0);
        (0..count)
            .map(|_| {
                // Box-Muller transform over two uniform draws.
                let u1: f32 = rng.gen_range(f32::MIN_POSITIVE..1.0);
                let u2: f32 = rng.gen();
                mean + scale * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
            })
            .collect()
    } else {
        let low = attrs.get_float("low").unwrap_or(0.0);
        let high = attrs.get_float("high").unwrap_or(1.0);
        (0..count).map(|_| rng.gen_range(low..high)).collect()
    };
    let dtype = attrs
        .get_int("dtype")
        .ok()
        .and_then(DType::from_tag)
        .unwrap_or(DType::F32);
    Ok(Value {
        dtype,
        shape,
        data: TensorData::F32(values),
    })
}

fn wrap_attr(err: npu_lower::attr::AttrError) -> BackendError {
    BackendError::execution(err.to_string())
}

/// Executes one node against the environment, inserting its outputs.
pub fn execute_node(
    node: &ModelNode,
    env: &mut HashMap<String, Value>,
) -> Result<(), BackendError> {
    let inputs: Vec<&Value> = node
        .inputs
        .iter()
        .map(|id| {
            env.get(id).ok_or_else(|| {
                BackendError::execution(format!("tensor `{id}` is not materialized"))
            })
        })
        .collect::<Result<_, _>>()?;
    let attrs = &node.attrs;

    let outputs: Vec<Value> = match node.op.as_str() {
        "npu_identity" => vec![inputs[0].clone()],
        "npu_add" => vec![elementwise(inputs[0], inputs[1], "add")?],
        "npu_sub" => vec![elementwise(inputs[0], inputs[1], "sub")?],
        "npu_mul" => vec![elementwise(inputs[0], inputs[1], "mul")?],
        "npu_div" => vec![elementwise(inputs[0], inputs[1], "div")?],
        "npu_pow" => vec![elementwise(inputs[0], inputs[1], "pow")?],
        "npu_sum" => {
            let mut acc = inputs[0].clone();
            for v in &inputs[1..] {
                acc = elementwise(&acc, v, "add")?;
            }
            vec![acc]
        }
        "npu_matmul" => vec![gemm(&inputs[..2], &AttrMap::new())?],
        "npu_gemm" => vec![gemm(&inputs, attrs)?],
        "npu_softmax" => vec![softmax(inputs[0], attrs.get_int_or("axis", -1))?],
        "npu_reducemean" => vec![reduce_mean(inputs[0], attrs)?],
        "npu_relu" => vec![unary(inputs[0], |x| x.max(0.0))],
        "npu_tanh" => vec![unary(inputs[0], f32::tanh)],
        "npu_log" => vec![unary(inputs[0], f32::ln)],
        "npu_sigmoid" => vec![unary(inputs[0], |x| 1.0 / (1.0 + (-x).exp()))],
        "npu_sqrt" => vec![unary(inputs[0], f32::sqrt)],
        "npu_gelu" => vec![unary(inputs[0], |x| {
            // tanh approximation
            0.5 * x * (1.0 + ((2.0 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x * x * x)).tanh())
        })],
        "npu_cast" => {
            let to = DType::from_tag(attrs.get_int("to").map_err(wrap_attr)?)
                .ok_or_else(|| BackendError::execution("cast has an unknown dtype tag"))?;
            vec![cast(inputs[0], to)?]
        }
        "npu_reshape" => {
            let spec = inputs[1].i64s()?;
            let shape = reshape_dims(inputs[0].numel(), &spec, &inputs[0].shape)?;
            let mut v = inputs[0].clone();
            v.shape = shape;
            vec![v]
        }
        "npu_transpose" => {
            let perm = attrs.get_ints("perm").map_err(wrap_attr)?;
            vec![transpose(inputs[0], &perm)?]
        }
        "npu_squeeze" => {
            let axes = attrs.get_ints("axes").map_err(wrap_attr)?;
            let mut v = inputs[0].clone();
            v.shape = squeeze_shape(&inputs[0].shape, &axes)?;
            vec![v]
        }
        "npu_unsqueeze" => {
            let axes = attrs.get_ints("axes").map_err(wrap_attr)?;
            let mut v = inputs[0].clone();
            v.shape = unsqueeze_shape(&inputs[0].shape, &axes)?;
            vec![v]
        }
        "npu_concat" => vec![concat(&inputs, attrs.get_int_or("axis", 0))?],
        "npu_slice" => vec![slice(&inputs)?],
        "npu_gather" => vec![gather(inputs[0], inputs[1], attrs.get_int_or("axis", 0))?],
        "npu_tile" => {
            let repeats = inputs[1].i64s()?;
            vec![tile(inputs[0], &repeats)?]
        }
        "npu_shape" => {
            let shape = inputs[0].shape.clone();
            vec![Value::from_i64(vec![shape.len() as i64], shape)]
        }
        "npu_nllloss" => vec![nll_loss(
            inputs[0],
            inputs[1],
            attrs.get_int_or("ignoreIndex", -100),
        )?],
        "npu_randomnormal" => vec![random(attrs, true)?],
        "npu_randomuniform" => vec![random(attrs, false)?],
        "npu_printtensor" => {
            let title = attrs.get_str_or("title", &node.debug_id);
            debug!("print tensor `{title}`: shape {:?}", inputs[0].shape);
            vec![inputs[0].clone()]
        }
        other => {
            return Err(BackendError::unimplemented(format!(
                "model device cannot execute `{other}`"
            )))
        }
    };

    if outputs.len() != node.outputs.len() {
        return Err(BackendError::execution(format!(
            "`{}` produced {} values for {} outputs",
            node.op,
            outputs.len(),
            node.outputs.len()
        )));
    }
    for (id, value) in node.outputs.iter().zip(outputs) {
        env.insert(id.clone(), value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(op: &str, inputs: &[&str], outputs: &[&str], attrs: AttrMap) -> ModelNode {
        ModelNode {
            op: op.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            attrs,
            debug_id: op.to_string(),
            custom: None,
            device_index: None,
            pipeline_stage: None,
        }
    }

    #[test]
    fn broadcast_add() {
        let mut env = HashMap::new();
        env.insert(
            "a".to_string(),
            Value::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]),
        );
        env.insert("b".to_string(), Value::from_f32(vec![2], vec![10.0, 20.0]));
        execute_node(&node("npu_add", &["a", "b"], &["c"], AttrMap::new()), &mut env).unwrap();
        assert_eq!(
            env["c"].data,
            TensorData::F32(vec![11.0, 22.0, 13.0, 24.0])
        );
    }

    #[test]
    fn gemm_transposes_and_scales() {
        let mut env = HashMap::new();
        env.insert(
            "a".to_string(),
            Value::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]),
        );
        env.insert(
            "b".to_string(),
            Value::from_f32(vec![2, 2], vec![1.0, 0.0, 0.0, 1.0]),
        );
        let attrs = AttrMap::new()
            .with("alpha", 2.0f32)
            .with("beta", 1.0f32)
            .with("transA", 1i64)
            .with("transB", 0i64);
        execute_node(&node("npu_gemm", &["a", "b"], &["y"], attrs), &mut env).unwrap();
        assert_eq!(env["y"].shape, vec![2, 2]);
        assert_eq!(env["y"].data, TensorData::F32(vec![2.0, 6.0, 4.0, 8.0]));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let value = Value::from_f32(vec![2, 3], vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let out = softmax(&value, -1).unwrap();
        let TensorData::F32(v) = &out.data else { panic!() };
        assert!((v[0] + v[1] + v[2] - 1.0).abs() < 1e-6);
        assert!((v[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn reduce_mean_over_axis_keeps_dim() {
        let mut env = HashMap::new();
        env.insert(
            "x".to_string(),
            Value::from_f32(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        );
        let attrs = AttrMap::new().with("axes", vec![1i64]).with("keepdims", 1i64);
        execute_node(&node("npu_reducemean", &["x"], &["y"], attrs), &mut env).unwrap();
        assert_eq!(env["y"].shape, vec![2, 1]);
        assert_eq!(env["y"].data, TensorData::F32(vec![2.0, 5.0]));
    }

    #[test]
    fn slice_middle_rows() {
        let mut env = HashMap::new();
        env.insert(
            "x".to_string(),
            Value::from_f32(vec![4, 1], vec![0.0, 1.0, 2.0, 3.0]),
        );
        env.insert("s".to_string(), Value::from_i64(vec![1], vec![1]));
        env.insert("e".to_string(), Value::from_i64(vec![1], vec![3]));
        env.insert("a".to_string(), Value::from_i64(vec![1], vec![0]));
        execute_node(
            &node("npu_slice", &["x", "s", "e", "a"], &["y"], AttrMap::new()),
            &mut env,
        )
        .unwrap();
        assert_eq!(env["y"].shape, vec![2, 1]);
        assert_eq!(env["y"].data, TensorData::F32(vec![1.0, 2.0]));
    }

    #[test]
    fn gather_rows() {
        let mut env = HashMap::new();
        env.insert(
            "table".to_string(),
            Value::from_f32(vec![3, 2], vec![0.0, 0.1, 1.0, 1.1, 2.0, 2.1]),
        );
        env.insert("ids".to_string(), Value::from_i64(vec![2], vec![2, 0]));
        execute_node(
            &node("npu_gather", &["table", "ids"], &["y"], AttrMap::new()),
            &mut env,
        )
        .unwrap();
        assert_eq!(env["y"].shape, vec![2, 2]);
        assert_eq!(env["y"].data, TensorData::F32(vec![2.0, 2.1, 0.0, 0.1]));
    }

    #[test]
    fn unknown_op_names_itself() {
        let mut env = HashMap::new();
        env.insert("x".to_string(), Value::from_f32(vec![1], vec![1.0]));
        let err = execute_node(&node("npu_conv", &["x"], &["y"], AttrMap::new()), &mut env)
            .unwrap_err();
        assert!(err.to_string().contains("npu_conv"));
    }

    #[test]
    fn reshape_infers_one_dim() {
        assert_eq!(reshape_dims(6, &[2, -1], &[6]).unwrap(), vec![2, 3]);
        assert_eq!(reshape_dims(6, &[0, 3], &[2, 3]).unwrap(), vec![2, 3]);
        assert!(reshape_dims(6, &[4, -1], &[6]).is_err());
    }
}
