//! Datapoint types, values and the codec used to convert between them
//!
//! Only a practical subset of the KNX datapoint main types is covered by
//! [`StandardDatapointCodec`]. Other encodings can be plugged in through the
//! [`DatapointCodec`] trait.

use crate::error::{KnxError, KnxResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// KNX datapoint main types understood by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatapointType {
    /// DPT 1, one bit
    Bool,
    /// DPT 4, 8-bit character
    Char,
    /// DPT 5, unsigned 8-bit
    Usint,
    /// DPT 6, signed 8-bit
    Sint,
    /// DPT 7, unsigned 16-bit
    Uint,
    /// DPT 8, signed 16-bit
    Int,
    /// DPT 9, 2-byte float
    Float16,
    /// DPT 12, unsigned 32-bit
    Udint,
    /// DPT 13, signed 32-bit
    Dint,
    /// DPT 14, IEEE 754 single precision
    Real,
    /// DPT 16, 14 character string
    String14,
}

impl DatapointType {
    pub fn size_in_bits(&self) -> u16 {
        match self {
            DatapointType::Bool => 1,
            DatapointType::Char | DatapointType::Usint | DatapointType::Sint => 8,
            DatapointType::Uint | DatapointType::Int | DatapointType::Float16 => 16,
            DatapointType::Udint | DatapointType::Dint | DatapointType::Real => 32,
            DatapointType::String14 => 112,
        }
    }

    /// Bytes occupied by one element when stored in device memory
    pub fn size_in_bytes(&self) -> usize {
        (self.size_in_bits() as usize).div_ceil(8)
    }

    /// Whether a value fits into the 6 spare bits of a group value APDU
    pub fn fits_in_first_byte(&self) -> bool {
        self.size_in_bits() <= 6
    }

    pub fn name(&self) -> &'static str {
        match self {
            DatapointType::Bool => "BOOL",
            DatapointType::Char => "CHAR",
            DatapointType::Usint => "USINT",
            DatapointType::Sint => "SINT",
            DatapointType::Uint => "UINT",
            DatapointType::Int => "INT",
            DatapointType::Float16 => "FLOAT16",
            DatapointType::Udint => "UDINT",
            DatapointType::Dint => "DINT",
            DatapointType::Real => "REAL",
            DatapointType::String14 => "STRING",
        }
    }
}

impl fmt::Display for DatapointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatapointType {
    type Err = KnxError;

    /// Accepts the type names (`BOOL`, `USINT`, ...) and the main type
    /// numbers (`DPT1`, `DPT_9`, `9`)
    fn from_str(s: &str) -> KnxResult<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let main = upper
            .strip_prefix("DPT")
            .map(|rest| rest.trim_start_matches('_'))
            .unwrap_or(upper.as_str());
        let main = main.split('.').next().unwrap_or(main);
        let dpt = match main {
            "BOOL" | "1" => DatapointType::Bool,
            "CHAR" | "4" => DatapointType::Char,
            "USINT" | "BYTE" | "5" => DatapointType::Usint,
            "SINT" | "6" => DatapointType::Sint,
            "UINT" | "WORD" | "7" => DatapointType::Uint,
            "INT" | "8" => DatapointType::Int,
            "FLOAT16" | "9" => DatapointType::Float16,
            "UDINT" | "DWORD" | "12" => DatapointType::Udint,
            "DINT" | "13" => DatapointType::Dint,
            "REAL" | "14" => DatapointType::Real,
            "STRING" | "16" => DatapointType::String14,
            _ => {
                return Err(KnxError::InvalidDatatype(format!(
                    "Unknown datapoint type: {}",
                    s
                )));
            }
        };
        Ok(dpt)
    }
}

/// Decoded value of a tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlcValue {
    Bool(bool),
    Char(char),
    Usint(u8),
    Sint(i8),
    Uint(u16),
    Int(i16),
    Udint(u32),
    Dint(i32),
    Real(f32),
    String(String),
    List(Vec<PlcValue>),
    Struct(BTreeMap<String, PlcValue>),
    RawBytes(Vec<u8>),
}

impl PlcValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PlcValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of scalar values
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PlcValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            PlcValue::Usint(v) => Some(*v as f64),
            PlcValue::Sint(v) => Some(*v as f64),
            PlcValue::Uint(v) => Some(*v as f64),
            PlcValue::Int(v) => Some(*v as f64),
            PlcValue::Udint(v) => Some(*v as f64),
            PlcValue::Dint(v) => Some(*v as f64),
            PlcValue::Real(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Collapse a single-element list into its element
    pub fn from_elements(mut elements: Vec<PlcValue>) -> PlcValue {
        if elements.len() == 1 {
            elements.remove(0)
        } else {
            PlcValue::List(elements)
        }
    }
}

/// Converts between raw datapoint bytes and values
///
/// `parse` receives exactly the bytes of one element. Types narrower than a
/// byte occupy the low bits of a single byte.
pub trait DatapointCodec: Send + Sync {
    fn parse(&self, data: &[u8], datapoint_type: DatapointType) -> KnxResult<PlcValue>;

    fn serialize(&self, value: &PlcValue, datapoint_type: DatapointType) -> KnxResult<Vec<u8>>;
}

/// Codec for the datapoint types listed in [`DatapointType`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardDatapointCodec;

impl StandardDatapointCodec {
    fn require(data: &[u8], len: usize, datapoint_type: DatapointType) -> KnxResult<()> {
        if data.len() < len {
            return Err(KnxError::InvalidData(format!(
                "{} needs {} bytes, got {}",
                datapoint_type,
                len,
                data.len()
            )));
        }
        Ok(())
    }

    fn mismatch(value: &PlcValue, datapoint_type: DatapointType) -> KnxError {
        KnxError::InvalidDatatype(format!("Cannot encode {:?} as {}", value, datapoint_type))
    }

    /// Integer view of a value, range checked by the caller
    fn integer(value: &PlcValue, datapoint_type: DatapointType) -> KnxResult<i64> {
        match value {
            PlcValue::Bool(b) => Ok(*b as i64),
            PlcValue::Usint(v) => Ok(*v as i64),
            PlcValue::Sint(v) => Ok(*v as i64),
            PlcValue::Uint(v) => Ok(*v as i64),
            PlcValue::Int(v) => Ok(*v as i64),
            PlcValue::Udint(v) => Ok(*v as i64),
            PlcValue::Dint(v) => Ok(*v as i64),
            _ => Err(Self::mismatch(value, datapoint_type)),
        }
    }

    fn ranged<T: TryFrom<i64>>(value: &PlcValue, datapoint_type: DatapointType) -> KnxResult<T> {
        let v = Self::integer(value, datapoint_type)?;
        T::try_from(v).map_err(|_| {
            KnxError::InvalidDatatype(format!("{} is out of range for {}", v, datapoint_type))
        })
    }

    fn decode_float16(raw: u16) -> f32 {
        let exponent = ((raw >> 11) & 0x0F) as i32;
        let mut mantissa = (raw & 0x07FF) as i32;
        if raw & 0x8000 != 0 {
            mantissa -= 2048;
        }
        (mantissa * (1 << exponent)) as f32 / 100.0
    }

    fn encode_float16(value: f32) -> KnxResult<u16> {
        if !value.is_finite() {
            return Err(KnxError::InvalidDatatype(format!("{} is not encodable as FLOAT16", value)));
        }
        let mut mantissa = (value * 100.0).round() as i64;
        let mut exponent = 0u16;
        while !(-2048..=2047).contains(&mantissa) {
            mantissa = (mantissa as f64 / 2.0).round() as i64;
            exponent += 1;
            if exponent > 15 {
                return Err(KnxError::InvalidDatatype(format!("{} is out of range for FLOAT16", value)));
            }
        }
        let sign = if mantissa < 0 { 0x8000 } else { 0 };
        Ok(sign | (exponent << 11) | (mantissa as u16 & 0x07FF))
    }
}

impl DatapointCodec for StandardDatapointCodec {
    fn parse(&self, data: &[u8], datapoint_type: DatapointType) -> KnxResult<PlcValue> {
        Self::require(data, datapoint_type.size_in_bytes(), datapoint_type)?;
        let value = match datapoint_type {
            DatapointType::Bool => PlcValue::Bool(data[0] & 0x01 != 0),
            DatapointType::Char => PlcValue::Char(data[0] as char),
            DatapointType::Usint => PlcValue::Usint(data[0]),
            DatapointType::Sint => PlcValue::Sint(data[0] as i8),
            DatapointType::Uint => PlcValue::Uint(u16::from_be_bytes([data[0], data[1]])),
            DatapointType::Int => PlcValue::Int(i16::from_be_bytes([data[0], data[1]])),
            DatapointType::Float16 => {
                PlcValue::Real(Self::decode_float16(u16::from_be_bytes([data[0], data[1]])))
            }
            DatapointType::Udint => {
                PlcValue::Udint(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
            }
            DatapointType::Dint => {
                PlcValue::Dint(i32::from_be_bytes([data[0], data[1], data[2], data[3]]))
            }
            DatapointType::Real => {
                PlcValue::Real(f32::from_be_bytes([data[0], data[1], data[2], data[3]]))
            }
            DatapointType::String14 => {
                // ISO 8859-1, NUL padded
                let text: String = data[..14]
                    .iter()
                    .take_while(|b| **b != 0)
                    .map(|b| *b as char)
                    .collect();
                PlcValue::String(text)
            }
        };
        Ok(value)
    }

    fn serialize(&self, value: &PlcValue, datapoint_type: DatapointType) -> KnxResult<Vec<u8>> {
        let bytes = match datapoint_type {
            DatapointType::Bool => match value {
                PlcValue::Bool(b) => vec![*b as u8],
                other => vec![(Self::integer(other, datapoint_type)? != 0) as u8],
            },
            DatapointType::Char => match value {
                PlcValue::Char(c) if (*c as u32) < 0x80 => vec![*c as u8],
                other => return Err(Self::mismatch(other, datapoint_type)),
            },
            DatapointType::Usint => vec![Self::ranged::<u8>(value, datapoint_type)?],
            DatapointType::Sint => Self::ranged::<i8>(value, datapoint_type)?.to_be_bytes().to_vec(),
            DatapointType::Uint => Self::ranged::<u16>(value, datapoint_type)?.to_be_bytes().to_vec(),
            DatapointType::Int => Self::ranged::<i16>(value, datapoint_type)?.to_be_bytes().to_vec(),
            DatapointType::Udint => Self::ranged::<u32>(value, datapoint_type)?.to_be_bytes().to_vec(),
            DatapointType::Dint => Self::ranged::<i32>(value, datapoint_type)?.to_be_bytes().to_vec(),
            DatapointType::Float16 | DatapointType::Real => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| Self::mismatch(value, datapoint_type))? as f32;
                if datapoint_type == DatapointType::Real {
                    v.to_be_bytes().to_vec()
                } else {
                    Self::encode_float16(v)?.to_be_bytes().to_vec()
                }
            }
            DatapointType::String14 => match value {
                PlcValue::String(s) => {
                    let mut out = Vec::with_capacity(14);
                    for c in s.chars() {
                        if (c as u32) > 0xFF {
                            return Err(KnxError::InvalidDatatype(format!(
                                "Character {:?} is not ISO 8859-1",
                                c
                            )));
                        }
                        out.push(c as u8);
                    }
                    if out.len() > 14 {
                        return Err(KnxError::InvalidDatatype(format!(
                            "String of {} characters exceeds 14",
                            out.len()
                        )));
                    }
                    out.resize(14, 0);
                    out
                }
                other => return Err(Self::mismatch(other, datapoint_type)),
            },
        };
        Ok(bytes)
    }
}
