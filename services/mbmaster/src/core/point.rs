//! Point values and register conversion
//!
//! Multi-register values use big-endian word order: the register at the
//! lowest address carries the most significant word.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::config::DataType;
use crate::error::{MasterError, Result};

/// Decoded value of a point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl PointValue {
    /// Value reported after a failed poll when zero-on-failed-poll is set
    pub fn zero(data_type: DataType) -> Self {
        match data_type {
            DataType::Bool => PointValue::Bool(false),
            DataType::Int16 | DataType::Int32 | DataType::Int64 => PointValue::Int(0),
            DataType::Uint16 | DataType::Uint32 | DataType::Uint64 => PointValue::UInt(0),
            DataType::Float32 | DataType::Float64 => PointValue::Float(0.0),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            PointValue::Bool(b) => Some(b),
            PointValue::Int(0) | PointValue::UInt(0) => Some(false),
            PointValue::Int(1) | PointValue::UInt(1) => Some(true),
            _ => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            PointValue::Bool(b) => Some(i128::from(b)),
            PointValue::Int(i) => Some(i128::from(i)),
            PointValue::UInt(u) => Some(i128::from(u)),
            PointValue::Float(f) if f.is_finite() && f.fract() == 0.0 => {
                // Integral floats outside i128 cannot be represented by any integer type anyway
                if f.abs() < 1.7e38 {
                    Some(f as i128)
                } else {
                    None
                }
            },
            PointValue::Float(_) => None,
        }
    }

    fn as_f64(&self) -> f64 {
        match *self {
            PointValue::Bool(b) => f64::from(u8::from(b)),
            PointValue::Int(i) => i as f64,
            PointValue::UInt(u) => u as f64,
            PointValue::Float(f) => f,
        }
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointValue::Bool(b) => write!(f, "{}", b),
            PointValue::Int(i) => write!(f, "{}", i),
            PointValue::UInt(u) => write!(f, "{}", u),
            PointValue::Float(v) => write!(f, "{}", v),
        }
    }
}

fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}

fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
        .collect()
}

/// Decode the registers covered by one point
pub fn decode_registers(data_type: DataType, registers: &[u16]) -> Result<PointValue> {
    let needed = usize::from(data_type.register_count());
    if registers.len() < needed {
        return Err(MasterError::internal(format!(
            "{} needs {} registers, got {}",
            data_type,
            needed,
            registers.len()
        )));
    }
    let bytes = registers_to_bytes(&registers[..needed]);

    let value = match data_type {
        DataType::Bool => PointValue::Bool(registers[0] != 0),
        DataType::Uint16 => PointValue::UInt(u64::from(registers[0])),
        DataType::Int16 => PointValue::Int(i64::from(registers[0] as i16)),
        DataType::Uint32 => PointValue::UInt(u64::from(u32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        DataType::Int32 => PointValue::Int(i64::from(i32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        DataType::Float32 => PointValue::Float(f64::from(f32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        DataType::Uint64 => PointValue::UInt(u64::from_be_bytes(eight(&bytes))),
        DataType::Int64 => PointValue::Int(i64::from_be_bytes(eight(&bytes))),
        DataType::Float64 => PointValue::Float(f64::from_be_bytes(eight(&bytes))),
    };
    trace!("Decoded {}: {:04X?} -> {}", data_type, &registers[..needed], value);
    Ok(value)
}

fn eight(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

/// Encode a value for a register write
pub fn encode_registers(data_type: DataType, value: &PointValue) -> Result<Vec<u16>> {
    let out_of_range = || {
        MasterError::config(format!("Value {} does not fit {}", value, data_type))
    };

    let registers = match data_type {
        DataType::Bool => vec![u16::from(value.as_bool().ok_or_else(out_of_range)?)],
        DataType::Uint16 => {
            let v = value.as_i128().ok_or_else(out_of_range)?;
            vec![u16::try_from(v).map_err(|_| out_of_range())?]
        },
        DataType::Int16 => {
            let v = value.as_i128().ok_or_else(out_of_range)?;
            vec![i16::try_from(v).map_err(|_| out_of_range())? as u16]
        },
        DataType::Uint32 => {
            let v = value.as_i128().ok_or_else(out_of_range)?;
            bytes_to_registers(&u32::try_from(v).map_err(|_| out_of_range())?.to_be_bytes())
        },
        DataType::Int32 => {
            let v = value.as_i128().ok_or_else(out_of_range)?;
            bytes_to_registers(&i32::try_from(v).map_err(|_| out_of_range())?.to_be_bytes())
        },
        DataType::Uint64 => {
            let v = value.as_i128().ok_or_else(out_of_range)?;
            bytes_to_registers(&u64::try_from(v).map_err(|_| out_of_range())?.to_be_bytes())
        },
        DataType::Int64 => {
            let v = value.as_i128().ok_or_else(out_of_range)?;
            bytes_to_registers(&i64::try_from(v).map_err(|_| out_of_range())?.to_be_bytes())
        },
        DataType::Float32 => bytes_to_registers(&(value.as_f64() as f32).to_be_bytes()),
        DataType::Float64 => bytes_to_registers(&value.as_f64().to_be_bytes()),
    };
    Ok(registers)
}
