//! Host tensor to CoreML `WeightParams` conversion.
//!
//! Float32 data goes to `floatValue` (or `float16Value` under
//! [`PrecisionPolicy::Float16`]). Float16 data is copied byte-for-byte into
//! `float16Value` since both sides use IEEE binary16 little-endian. Integer
//! data is converted element-wise to float32 and must be exactly
//! representable. Element order is row-major throughout.

use half::f16;
use offload_graph::{DataType, Initializer};

use crate::error::EncodeError;
use crate::options::PrecisionPolicy;
use crate::proto::WeightParams;

/// Largest integer magnitude a float32 represents exactly.
const F32_EXACT_INT: i64 = 1 << 24;

/// Element types [`encode_weight`] accepts.
pub const SUPPORTED_WEIGHT_TYPES: [DataType; 4] = [
    DataType::Float,
    DataType::Float16,
    DataType::Int32,
    DataType::Int64,
];

/// Encodes an initializer into backend weight storage.
pub fn encode_weight(
    tensor: &Initializer,
    precision: PrecisionPolicy,
) -> Result<WeightParams, EncodeError> {
    check_payload(tensor)?;
    match tensor.data_type {
        DataType::Float => Ok(weight_from_f32(&read_f32(&tensor.raw), precision)),
        DataType::Float16 => Ok(WeightParams {
            float16_value: tensor.raw.clone(),
            ..Default::default()
        }),
        DataType::Int32 | DataType::Int64 => {
            let values = integer_values(tensor)?;
            Ok(WeightParams {
                float_value: values.into_iter().map(|v| v as f32).collect(),
                ..Default::default()
            })
        }
        other => Err(EncodeError::UnsupportedDataType(other)),
    }
}

/// Weight storage for already-converted float32 values.
pub fn weight_from_f32(values: &[f32], precision: PrecisionPolicy) -> WeightParams {
    match precision {
        PrecisionPolicy::Keep => WeightParams {
            float_value: values.to_vec(),
            ..Default::default()
        },
        PrecisionPolicy::Float16 => WeightParams {
            float16_value: values
                .iter()
                .flat_map(|&v| f16::from_f32(v).to_le_bytes())
                .collect(),
            ..Default::default()
        },
    }
}

/// Reads a floating-point initializer as float32 values.
///
/// Used by lowering units that rearrange weights before encoding.
pub fn initializer_to_f32(tensor: &Initializer) -> Result<Vec<f32>, EncodeError> {
    check_payload(tensor)?;
    match tensor.data_type {
        DataType::Float => Ok(read_f32(&tensor.raw)),
        DataType::Float16 => Ok(read_f16(&tensor.raw).into_iter().map(f16::to_f32).collect()),
        other => Err(EncodeError::UnsupportedDataType(other)),
    }
}

/// Decodes backend weight storage back into a host tensor of `data_type`.
///
/// Inverse of [`encode_weight`] under [`PrecisionPolicy::Keep`].
pub fn decode_weight(
    weight: &WeightParams,
    data_type: DataType,
    dims: &[i64],
) -> Result<Initializer, EncodeError> {
    let raw = match data_type {
        DataType::Float => weight_to_f32(weight)
            .into_iter()
            .flat_map(f32::to_le_bytes)
            .collect(),
        DataType::Float16 => {
            if weight.float16_value.is_empty() {
                weight
                    .float_value
                    .iter()
                    .flat_map(|&v| f16::from_f32(v).to_le_bytes())
                    .collect()
            } else {
                weight.float16_value.clone()
            }
        }
        DataType::Int32 => weight_to_f32(weight)
            .into_iter()
            .flat_map(|v| (v as i32).to_le_bytes())
            .collect(),
        DataType::Int64 => weight_to_f32(weight)
            .into_iter()
            .flat_map(|v| (v as i64).to_le_bytes())
            .collect(),
        other => return Err(EncodeError::UnsupportedDataType(other)),
    };
    Initializer::new(data_type, dims.to_vec(), raw).map_err(EncodeError::InvalidTensorData)
}

/// Number of stored elements, whichever field holds them.
pub fn weight_len(weight: &WeightParams) -> usize {
    if !weight.float_value.is_empty() {
        weight.float_value.len()
    } else {
        weight.float16_value.len() / 2
    }
}

fn weight_to_f32(weight: &WeightParams) -> Vec<f32> {
    if weight.float_value.is_empty() && !weight.float16_value.is_empty() {
        read_f16(&weight.float16_value)
            .into_iter()
            .map(f16::to_f32)
            .collect()
    } else {
        weight.float_value.clone()
    }
}

fn check_payload(tensor: &Initializer) -> Result<(), EncodeError> {
    let width = tensor
        .data_type
        .size_in_bytes()
        .ok_or(EncodeError::UnsupportedDataType(tensor.data_type))?;
    let expected = tensor
        .element_count()
        .checked_mul(width)
        .ok_or_else(|| EncodeError::InvalidTensorData(format!("{:?} overflows", tensor.dims)))?;
    if tensor.raw.len() != expected {
        return Err(EncodeError::InvalidTensorData(format!(
            "{} {:?}: expected {expected} bytes, found {}",
            tensor.data_type,
            tensor.dims,
            tensor.raw.len()
        )));
    }
    Ok(())
}

fn integer_values(tensor: &Initializer) -> Result<Vec<i64>, EncodeError> {
    let values = tensor
        .to_i64_vec()
        .ok_or(EncodeError::UnsupportedDataType(tensor.data_type))?;
    if let Some(v) = values.iter().find(|v| v.abs() > F32_EXACT_INT) {
        return Err(EncodeError::InvalidTensorData(format!(
            "{} value {v} is not exactly representable as float32",
            tensor.data_type
        )));
    }
    Ok(values)
}

fn read_f32(raw: &[u8]) -> Vec<f32> {
    raw.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn read_f16(raw: &[u8]) -> Vec<f16> {
    raw.chunks_exact(2)
        .map(|c| f16::from_le_bytes([c[0], c[1]]))
        .collect()
}
