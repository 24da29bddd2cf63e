//! Register value codec
//!
//! Converts between raw 16-bit registers and signal values. Multi-register
//! values are first normalised to big-endian bytes (ABCD), then decoded;
//! encoding runs the same steps in reverse.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::model::signal::SignalValue;
use crate::error::{Result, ScoutSrvError};

/// Word and byte order of multi-register values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ByteOrder {
    /// Big-endian, registers as transmitted
    #[default]
    Abcd,
    /// Word swap
    Cdab,
    /// Byte swap within each word
    Badc,
    /// Word swap and byte swap
    Dcba,
}

impl ByteOrder {
    /// Parse `ABCD`-style names and the common long-form aliases
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "" | "ABCD" | "BIG_ENDIAN" | "BE" | "BIG_BIG" => Some(Self::Abcd),
            "CDAB" | "LITTLE_ENDIAN" | "WORD_SWAP" | "BIG_ENDIAN_SWAP" => Some(Self::Cdab),
            "BADC" | "BIG_ENDIAN_BYTE_SWAP" | "BYTE_SWAP" | "LITTLE_ENDIAN_SWAP" => Some(Self::Badc),
            "DCBA" | "LITTLE_ENDIAN_BYTE_SWAP" | "LE" | "LITTLE_LITTLE" => Some(Self::Dcba),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abcd => "ABCD",
            Self::Cdab => "CDAB",
            Self::Badc => "BADC",
            Self::Dcba => "DCBA",
        }
    }

    fn swaps_bytes(self) -> bool {
        matches!(self, Self::Badc | Self::Dcba)
    }

    fn swaps_words(self) -> bool {
        matches!(self, Self::Cdab | Self::Dcba)
    }

    /// Reorder registers; the operation is its own inverse
    pub fn reorder(self, registers: &[u16]) -> Vec<u16> {
        let mut words: Vec<u16> = if self.swaps_bytes() {
            registers.iter().map(|w| w.swap_bytes()).collect()
        } else {
            registers.to_vec()
        };
        if self.swaps_words() {
            words.reverse();
        }
        words
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interpretation of one or more registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegisterDataType {
    Int16,
    Uint16,
    /// Unsigned, displayed as `0x%04X`
    Hex16,
    /// Unsigned, displayed as `0b%016b`
    Binary16,
    Int32,
    Uint32,
    Float32,
    Int64,
    Uint64,
    Float64,
    Bool,
    Bcd16,
    Bcd32,
    /// Packed ASCII, two characters per register
    String(u16),
}

impl RegisterDataType {
    /// Parse a type name (`INT16`, `float32`, `STRING(20)`, ...)
    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.trim().to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("STRING") {
            let digits = rest.trim_matches(|c: char| c == '(' || c == ')' || c == ':' || c.is_whitespace());
            let length = if digits.is_empty() {
                DEFAULT_STRING_LENGTH
            } else {
                digits.parse().ok()?
            };
            return Some(Self::String(length));
        }
        Some(match upper.as_str() {
            "INT16" | "I16" | "SHORT" => Self::Int16,
            "UINT16" | "U16" | "WORD" => Self::Uint16,
            "HEX16" | "HEX" => Self::Hex16,
            "BINARY16" | "BIN16" | "BINARY" => Self::Binary16,
            "INT32" | "I32" | "LONG" => Self::Int32,
            "UINT32" | "U32" | "DWORD" => Self::Uint32,
            "FLOAT32" | "F32" | "FLOAT" | "REAL" => Self::Float32,
            "INT64" | "I64" => Self::Int64,
            "UINT64" | "U64" | "QWORD" => Self::Uint64,
            "FLOAT64" | "F64" | "DOUBLE" => Self::Float64,
            "BOOL" | "BOOLEAN" | "BIT" => Self::Bool,
            "BCD16" | "BCD" => Self::Bcd16,
            "BCD32" => Self::Bcd32,
            _ => return None,
        })
    }

    /// Number of registers the value occupies
    pub fn register_count(self) -> u16 {
        match self {
            Self::Int16
            | Self::Uint16
            | Self::Hex16
            | Self::Binary16
            | Self::Bool
            | Self::Bcd16 => 1,
            Self::Int32 | Self::Uint32 | Self::Float32 | Self::Bcd32 => 2,
            Self::Int64 | Self::Uint64 | Self::Float64 => 4,
            Self::String(length) => length.div_ceil(2).max(1),
        }
    }

    /// Whether scale and offset apply
    pub fn is_scalable(self) -> bool {
        !matches!(
            self,
            Self::Bool | Self::String(_) | Self::Hex16 | Self::Binary16
        )
    }
}

impl fmt::Display for RegisterDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(n) => write!(f, "STRING({n})"),
            other => write!(f, "{}", format!("{other:?}").to_ascii_uppercase()),
        }
    }
}

const DEFAULT_STRING_LENGTH: u16 = 16;

/// Linear transform applied to numeric values: `raw * scale + offset`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    pub scale: f64,
    pub offset: f64,
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: 0.0,
        }
    }
}

impl Scaling {
    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0
    }
}

// ============================================================================
// Decoding
// ============================================================================

fn to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

fn from_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
        .collect()
}

fn bcd_decode(bytes: &[u8]) -> Result<i64> {
    let mut value = 0i64;
    for byte in bytes {
        for nibble in [byte >> 4, byte & 0x0F] {
            if nibble > 9 {
                return Err(ScoutSrvError::data(format!(
                    "invalid BCD digit 0x{nibble:X}"
                )));
            }
            value = value * 10 + i64::from(nibble);
        }
    }
    Ok(value)
}

fn bcd_encode(value: i64, digits: usize) -> Result<Vec<u8>> {
    let text = format!("{value:0digits$}");
    if value < 0 || text.len() > digits {
        return Err(ScoutSrvError::data(format!(
            "{value} does not fit {digits} BCD digits"
        )));
    }
    Ok(text
        .as_bytes()
        .chunks(2)
        .map(|pair| ((pair[0] - b'0') << 4) | (pair[1] - b'0'))
        .collect())
}

fn scaled(raw: i64, scaling: Scaling) -> SignalValue {
    if scaling.is_identity() {
        SignalValue::Int(raw)
    } else {
        SignalValue::Float(raw as f64 * scaling.scale + scaling.offset)
    }
}

fn scaled_unsigned(raw: u64, scaling: Scaling) -> SignalValue {
    match i64::try_from(raw) {
        Ok(v) => scaled(v, scaling),
        Err(_) => SignalValue::Float(raw as f64 * scaling.scale + scaling.offset),
    }
}

/// Decode the registers of one value
///
/// `registers` must hold at least `data_type.register_count()` words; extra
/// words are ignored.
pub fn decode(
    registers: &[u16],
    data_type: RegisterDataType,
    order: ByteOrder,
    scaling: Scaling,
) -> Result<SignalValue> {
    let count = usize::from(data_type.register_count());
    if registers.len() < count {
        return Err(ScoutSrvError::data(format!(
            "{data_type} needs {count} registers, got {}",
            registers.len()
        )));
    }
    let bytes = to_bytes(&order.reorder(&registers[..count]));

    let value = match data_type {
        RegisterDataType::Int16 => scaled(i64::from(i16::from_be_bytes([bytes[0], bytes[1]])), scaling),
        RegisterDataType::Uint16 => scaled(i64::from(u16::from_be_bytes([bytes[0], bytes[1]])), scaling),
        RegisterDataType::Hex16 => {
            SignalValue::Text(format!("0x{:04X}", u16::from_be_bytes([bytes[0], bytes[1]])))
        },
        RegisterDataType::Binary16 => {
            SignalValue::Text(format!("0b{:016b}", u16::from_be_bytes([bytes[0], bytes[1]])))
        },
        RegisterDataType::Int32 => {
            scaled(i64::from(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])), scaling)
        },
        RegisterDataType::Uint32 => {
            scaled(i64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])), scaling)
        },
        RegisterDataType::Float32 => {
            let raw = f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            SignalValue::Float(f64::from(raw) * scaling.scale + scaling.offset)
        },
        RegisterDataType::Int64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            scaled(i64::from_be_bytes(buf), scaling)
        },
        RegisterDataType::Uint64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            scaled_unsigned(u64::from_be_bytes(buf), scaling)
        },
        RegisterDataType::Float64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            SignalValue::Float(f64::from_be_bytes(buf) * scaling.scale + scaling.offset)
        },
        RegisterDataType::Bool => SignalValue::Bool(u16::from_be_bytes([bytes[0], bytes[1]]) != 0),
        RegisterDataType::Bcd16 => scaled(bcd_decode(&bytes[..2])?, scaling),
        RegisterDataType::Bcd32 => scaled(bcd_decode(&bytes[..4])?, scaling),
        RegisterDataType::String(length) => {
            let end = usize::from(length).min(bytes.len());
            let text: String = bytes[..end]
                .iter()
                .take_while(|b| **b != 0)
                .map(|b| char::from(*b))
                .collect();
            if !text.is_ascii() {
                return Err(ScoutSrvError::data("string register holds non-ASCII bytes"));
            }
            SignalValue::Text(text)
        },
    };
    Ok(value)
}

// ============================================================================
// Encoding
// ============================================================================

fn numeric(value: &SignalValue, data_type: RegisterDataType) -> Result<f64> {
    match value {
        SignalValue::Text(s) => {
            let trimmed = s.trim();
            let parsed = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
                i64::from_str_radix(hex, 16).ok().map(|v| v as f64)
            } else if let Some(bin) = trimmed.strip_prefix("0b") {
                i64::from_str_radix(bin, 2).ok().map(|v| v as f64)
            } else {
                trimmed.parse::<f64>().ok()
            };
            parsed.ok_or_else(|| {
                ScoutSrvError::data(format!("'{s}' is not a valid {data_type} value"))
            })
        },
        other => other
            .as_f64()
            .ok_or_else(|| ScoutSrvError::data(format!("{other} is not a valid {data_type} value"))),
    }
}

fn integer_in_range(raw: f64, min: f64, max: f64, data_type: RegisterDataType) -> Result<i128> {
    let rounded = raw.round();
    if !rounded.is_finite() || rounded < min || rounded > max {
        return Err(ScoutSrvError::data(format!(
            "{raw} is out of range for {data_type}"
        )));
    }
    Ok(rounded as i128)
}

/// Encode a value into registers, applying the inverse of `scaling`
pub fn encode(
    value: &SignalValue,
    data_type: RegisterDataType,
    order: ByteOrder,
    scaling: Scaling,
) -> Result<Vec<u16>> {
    let raw = || -> Result<f64> {
        let v = numeric(value, data_type)?;
        if data_type.is_scalable() {
            let scale = if scaling.scale == 0.0 { 1.0 } else { scaling.scale };
            Ok((v - scaling.offset) / scale)
        } else {
            Ok(v)
        }
    };

    let bytes: Vec<u8> = match data_type {
        RegisterDataType::Int16 => {
            let v = integer_in_range(raw()?, f64::from(i16::MIN), f64::from(i16::MAX), data_type)?;
            (v as i16).to_be_bytes().to_vec()
        },
        RegisterDataType::Uint16 | RegisterDataType::Hex16 | RegisterDataType::Binary16 => {
            let v = integer_in_range(raw()?, 0.0, f64::from(u16::MAX), data_type)?;
            (v as u16).to_be_bytes().to_vec()
        },
        RegisterDataType::Int32 => {
            let v = integer_in_range(raw()?, f64::from(i32::MIN), f64::from(i32::MAX), data_type)?;
            (v as i32).to_be_bytes().to_vec()
        },
        RegisterDataType::Uint32 => {
            let v = integer_in_range(raw()?, 0.0, f64::from(u32::MAX), data_type)?;
            (v as u32).to_be_bytes().to_vec()
        },
        RegisterDataType::Float32 => (raw()? as f32).to_be_bytes().to_vec(),
        RegisterDataType::Int64 => {
            let v = integer_in_range(raw()?, i64::MIN as f64, i64::MAX as f64, data_type)?;
            (v as i64).to_be_bytes().to_vec()
        },
        RegisterDataType::Uint64 => {
            let v = integer_in_range(raw()?, 0.0, u64::MAX as f64, data_type)?;
            (v as u64).to_be_bytes().to_vec()
        },
        RegisterDataType::Float64 => raw()?.to_be_bytes().to_vec(),
        RegisterDataType::Bool => {
            let on = match value {
                SignalValue::Text(s) => SignalValue::parse(s).as_bool(),
                other => other.as_bool(),
            }
            .ok_or_else(|| ScoutSrvError::data(format!("{value} is not a boolean")))?;
            u16::from(on).to_be_bytes().to_vec()
        },
        RegisterDataType::Bcd16 => {
            let v = integer_in_range(raw()?, 0.0, 9999.0, data_type)?;
            bcd_encode(v as i64, 4)?
        },
        RegisterDataType::Bcd32 => {
            let v = integer_in_range(raw()?, 0.0, 99_999_999.0, data_type)?;
            bcd_encode(v as i64, 8)?
        },
        RegisterDataType::String(length) => {
            let text = value.to_string();
            if !text.is_ascii() {
                return Err(ScoutSrvError::data("string values must be ASCII"));
            }
            if text.len() > usize::from(length) {
                return Err(ScoutSrvError::data(format!(
                    "string of {} characters exceeds {length}",
                    text.len()
                )));
            }
            let mut bytes = text.into_bytes();
            bytes.resize(usize::from(data_type.register_count()) * 2, 0);
            bytes
        },
    };

    Ok(order.reorder(&from_bytes(&bytes)))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_byte_order_reorder() {
        let regs = [0x1234, 0x5678];
        assert_eq!(ByteOrder::Abcd.reorder(&regs), vec![0x1234, 0x5678]);
        assert_eq!(ByteOrder::Cdab.reorder(&regs), vec![0x5678, 0x1234]);
        assert_eq!(ByteOrder::Badc.reorder(&regs), vec![0x3412, 0x7856]);
        assert_eq!(ByteOrder::Dcba.reorder(&regs), vec![0x7856, 0x3412]);
    }

    #[test]
    fn test_byte_order_parse_aliases() {
        assert_eq!(ByteOrder::parse("abcd"), Some(ByteOrder::Abcd));
        assert_eq!(ByteOrder::parse("Little-endian"), Some(ByteOrder::Cdab));
        assert_eq!(ByteOrder::parse("BADC"), Some(ByteOrder::Badc));
        assert_eq!(ByteOrder::parse(""), Some(ByteOrder::Abcd));
        assert_eq!(ByteOrder::parse("XYZW"), None);
    }

    #[test]
    fn test_float32_byte_orders() {
        // 25.0 = 0x41C80000
        let abcd = decode(&[0x41C8, 0x0000], RegisterDataType::Float32, ByteOrder::Abcd, Scaling::default()).unwrap();
        let cdab = decode(&[0x0000, 0x41C8], RegisterDataType::Float32, ByteOrder::Cdab, Scaling::default()).unwrap();
        let dcba = decode(&[0x0000, 0xC841], RegisterDataType::Float32, ByteOrder::Dcba, Scaling::default()).unwrap();
        assert_eq!(abcd, SignalValue::Float(25.0));
        assert_eq!(cdab, SignalValue::Float(25.0));
        assert_eq!(dcba, SignalValue::Float(25.0));
    }

    #[test]
    fn test_signed_and_scaled() {
        let v = decode(&[0xFFFF], RegisterDataType::Int16, ByteOrder::Abcd, Scaling::default()).unwrap();
        assert_eq!(v, SignalValue::Int(-1));
        let scaling = Scaling { scale: 0.1, offset: 2.0 };
        let v = decode(&[100], RegisterDataType::Uint16, ByteOrder::Abcd, scaling).unwrap();
        assert!(matches!(v, SignalValue::Float(f) if (f - 12.0).abs() < 1e-9));
    }

    #[test]
    fn test_display_formats_ignore_scaling() {
        let scaling = Scaling { scale: 10.0, offset: 1.0 };
        assert_eq!(
            decode(&[0x00AB], RegisterDataType::Hex16, ByteOrder::Abcd, scaling).unwrap(),
            SignalValue::Text("0x00AB".into())
        );
        assert_eq!(
            decode(&[0x0005], RegisterDataType::Binary16, ByteOrder::Abcd, scaling).unwrap(),
            SignalValue::Text("0b0000000000000101".into())
        );
    }

    #[test]
    fn test_bcd() {
        assert_eq!(
            decode(&[0x1234], RegisterDataType::Bcd16, ByteOrder::Abcd, Scaling::default()).unwrap(),
            SignalValue::Int(1234)
        );
        assert!(decode(&[0x12A4], RegisterDataType::Bcd16, ByteOrder::Abcd, Scaling::default()).is_err());
        assert_eq!(
            encode(&SignalValue::Int(87654321), RegisterDataType::Bcd32, ByteOrder::Abcd, Scaling::default()).unwrap(),
            vec![0x8765, 0x4321]
        );
    }

    #[test]
    fn test_string_packing() {
        let dt = RegisterDataType::String(5);
        assert_eq!(dt.register_count(), 3);
        let regs = encode(&SignalValue::Text("ABCDE".into()), dt, ByteOrder::Abcd, Scaling::default()).unwrap();
        assert_eq!(regs, vec![0x4142, 0x4344, 0x4500]);
        assert_eq!(
            decode(&regs, dt, ByteOrder::Abcd, Scaling::default()).unwrap(),
            SignalValue::Text("ABCDE".into())
        );
    }

    #[test]
    fn test_encode_applies_inverse_scaling() {
        let scaling = Scaling { scale: 0.1, offset: 0.0 };
        let regs = encode(&SignalValue::Float(12.3), RegisterDataType::Int16, ByteOrder::Abcd, scaling).unwrap();
        assert_eq!(regs, vec![123]);
    }

    #[test]
    fn test_encode_out_of_range() {
        assert!(encode(&SignalValue::Int(70000), RegisterDataType::Uint16, ByteOrder::Abcd, Scaling::default()).is_err());
        assert!(encode(&SignalValue::Int(-1), RegisterDataType::Uint32, ByteOrder::Abcd, Scaling::default()).is_err());
    }

    #[test]
    fn test_encode_uint32_word_swap() {
        let regs = encode(&SignalValue::Int(0x12345678), RegisterDataType::Uint32, ByteOrder::Cdab, Scaling::default()).unwrap();
        assert_eq!(regs, vec![0x5678, 0x1234]);
    }

    #[test]
    fn test_data_type_parse() {
        assert_eq!(RegisterDataType::parse("float32"), Some(RegisterDataType::Float32));
        assert_eq!(RegisterDataType::parse("STRING(20)"), Some(RegisterDataType::String(20)));
        assert_eq!(RegisterDataType::parse("STRING"), Some(RegisterDataType::String(16)));
        assert_eq!(RegisterDataType::parse("BOOLEAN"), Some(RegisterDataType::Bool));
        assert_eq!(RegisterDataType::parse("VARIANT"), None);
        assert_eq!(RegisterDataType::Float64.register_count(), 4);
        assert_eq!(RegisterDataType::String(20).to_string(), "STRING(20)");
    }
}
