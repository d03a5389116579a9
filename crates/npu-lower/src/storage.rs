//! Host-side variable storage, the bridge's view of the front end's scope.

use std::collections::HashMap;

use half::f16;

use crate::dtype::DType;

/// A typed host tensor stored as raw bytes in native byte order.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBuffer {
    dtype: DType,
    shape: Vec<i64>,
    bytes: Vec<u8>,
}

impl HostBuffer {
    pub fn new(dtype: DType, shape: Vec<i64>, bytes: Vec<u8>) -> Self {
        Self {
            dtype,
            shape,
            bytes,
        }
    }

    pub fn zeros(dtype: DType, shape: Vec<i64>) -> Self {
        let numel = shape.iter().product::<i64>().max(0) as usize;
        Self {
            dtype,
            shape,
            bytes: vec![0u8; numel * dtype.size_in_bytes()],
        }
    }

    pub fn from_f32(shape: Vec<i64>, values: &[f32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self {
            dtype: DType::F32,
            shape,
            bytes,
        }
    }

    pub fn from_f16(shape: Vec<i64>, values: &[f16]) -> Self {
        let bytes = values
            .iter()
            .flat_map(|v| v.to_bits().to_ne_bytes())
            .collect();
        Self {
            dtype: DType::F16,
            shape,
            bytes,
        }
    }

    pub fn from_i32(shape: Vec<i64>, values: &[i32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self {
            dtype: DType::I32,
            shape,
            bytes,
        }
    }

    pub fn from_i64(shape: Vec<i64>, values: &[i64]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self {
            dtype: DType::I64,
            shape,
            bytes,
        }
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self::from_f32(vec![1], &[value])
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product::<i64>().max(0) as usize
    }

    /// Resizes to a new shape, zero-filling the byte store.
    pub fn resize(&mut self, shape: Vec<i64>) {
        let numel = shape.iter().product::<i64>().max(0) as usize;
        self.shape = shape;
        self.bytes = vec![0u8; numel * self.dtype.size_in_bytes()];
    }

    /// Replaces the raw bytes; the length must match the current shape.
    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        debug_assert_eq!(bytes.len(), self.numel() * self.dtype.size_in_bytes());
        self.bytes = bytes;
    }

    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.dtype != DType::F32 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn to_f16_vec(&self) -> Option<Vec<f16>> {
        if self.dtype != DType::F16 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_ne_bytes([c[0], c[1]])))
                .collect(),
        )
    }

    pub fn to_i32_vec(&self) -> Option<Vec<i32>> {
        if self.dtype != DType::I32 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        if self.dtype != DType::I64 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(8)
                .map(|c| {
                    i64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                })
                .collect(),
        )
    }
}

/// Named variable lookup backing weight lowering and weight sync.
pub trait VariableStorage {
    fn find(&self, name: &str) -> Option<&HostBuffer>;
    fn find_mut(&mut self, name: &str) -> Option<&mut HostBuffer>;
}

/// Plain in-memory storage used by front ends and tests.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    vars: HashMap<String, HostBuffer>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, buffer: HostBuffer) {
        self.vars.insert(name.into(), buffer);
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.vars.keys()
    }
}

impl VariableStorage for InMemoryStorage {
    fn find(&self, name: &str) -> Option<&HostBuffer> {
        self.vars.get(name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut HostBuffer> {
        self.vars.get_mut(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_round_trip() {
        let buf = HostBuffer::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buf.numel(), 4);
        assert_eq!(buf.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(buf.to_i32_vec().is_none());
    }

    #[test]
    fn resize_zero_fills() {
        let mut buf = HostBuffer::from_f32(vec![2], &[1.0, 2.0]);
        buf.resize(vec![3]);
        assert_eq!(buf.to_f32_vec().unwrap(), vec![0.0, 0.0, 0.0]);
    }
}
