//! Precision conversion for host/device weight transfers.

use half::f16;
use thiserror::Error;

use crate::dtype::DType;
use crate::storage::HostBuffer;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("transfer from host {host} to device {device} is unimplemented")]
    Unimplemented { host: DType, device: DType },
    #[error("unsupported host dtype {0} for weight transfer")]
    Unsupported(DType),
}

fn f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn f16s(bytes: &[u8]) -> Vec<f16> {
    bytes
        .chunks_exact(2)
        .map(|c| f16::from_bits(u16::from_ne_bytes([c[0], c[1]])))
        .collect()
}

/// Produces device-layout bytes from a host buffer.
///
/// Pairings follow the weight-sync contract: like-for-like copies raw, a
/// float32 host buffer converts down to a float16 device tensor, and a
/// float16 host buffer cannot widen on the way in.
pub fn host_to_device(host: &HostBuffer, device_dtype: DType) -> Result<Vec<u8>, ConvertError> {
    match (host.dtype(), device_dtype) {
        (DType::F32, DType::F32) | (DType::F16, DType::F16) => Ok(host.bytes().to_vec()),
        (DType::F32, DType::F16) => Ok(f32s(host.bytes())
            .into_iter()
            .flat_map(|v| f16::from_f32(v).to_bits().to_ne_bytes())
            .collect()),
        (DType::F16, DType::F32) => Err(ConvertError::Unimplemented {
            host: DType::F16,
            device: DType::F32,
        }),
        (other, _) => Err(ConvertError::Unsupported(other)),
    }
}

/// Writes device bytes back into a host buffer, widening float16 as needed.
pub fn device_to_host(
    device_bytes: &[u8],
    device_dtype: DType,
    host: &mut HostBuffer,
) -> Result<(), ConvertError> {
    match (host.dtype(), device_dtype) {
        (DType::F32, DType::F32) | (DType::F16, DType::F16) => {
            host.set_bytes(device_bytes.to_vec());
            Ok(())
        }
        (DType::F32, DType::F16) => {
            let widened: Vec<u8> = f16s(device_bytes)
                .into_iter()
                .flat_map(|v| v.to_f32().to_ne_bytes())
                .collect();
            host.set_bytes(widened);
            Ok(())
        }
        (DType::F16, DType::F32) => Err(ConvertError::Unimplemented {
            host: DType::F16,
            device: DType::F32,
        }),
        (other, _) => Err(ConvertError::Unsupported(other)),
    }
}
