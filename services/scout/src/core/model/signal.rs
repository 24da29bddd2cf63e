//! Addressable data points

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::iec61850::client::{Fc, MmsType, MmsValue};
use crate::core::modbus::codec::{ByteOrder, RegisterDataType};
use crate::error::ControlError;

/// Quality of a signal's current value
///
/// Anything but `Good` means the value must not drive control decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quality {
    Good,
    #[default]
    NotConnected,
    Invalid,
    Stale,
}

impl Quality {
    pub fn is_good(self) -> bool {
        self == Quality::Good
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Quality::Good => "GOOD",
            Quality::NotConnected => "NOT_CONNECTED",
            Quality::Invalid => "INVALID",
            Quality::Stale => "STALE",
        };
        f.write_str(s)
    }
}

/// Coarse signal classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Binary,
    Analog,
    String,
    Structured,
}

impl SignalKind {
    pub fn from_mms_type(mms_type: MmsType) -> Self {
        match mms_type {
            MmsType::Boolean => SignalKind::Binary,
            MmsType::Integer | MmsType::Unsigned | MmsType::Float => SignalKind::Analog,
            MmsType::VisibleString => SignalKind::String,
            MmsType::BitString | MmsType::UtcTime | MmsType::Structure => SignalKind::Structured,
        }
    }
}

/// Protocol-specific type information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum SignalType {
    Iec61850 { mms_type: MmsType, fc: Fc },
    Modbus {
        data_type: RegisterDataType,
        byte_order: ByteOrder,
    },
}

/// Signal value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Structured(Vec<SignalValue>),
}

impl SignalValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            SignalValue::Int(v) => Some(*v as f64),
            SignalValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SignalValue::Bool(b) => Some(*b),
            SignalValue::Int(v) => Some(*v != 0),
            SignalValue::Float(v) => Some(*v != 0.0),
            _ => None,
        }
    }

    /// Parse an operator-entered value: `true`/`false`, integer, float, else text
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "true" | "on" => return SignalValue::Bool(true),
            "false" | "off" => return SignalValue::Bool(false),
            _ => {},
        }
        if let Ok(v) = trimmed.parse::<i64>() {
            return SignalValue::Int(v);
        }
        if let Ok(v) = trimmed.parse::<f64>() {
            return SignalValue::Float(v);
        }
        SignalValue::Text(trimmed.to_string())
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Bool(b) => write!(f, "{b}"),
            SignalValue::Int(v) => write!(f, "{v}"),
            SignalValue::Float(v) => write!(f, "{v}"),
            SignalValue::Text(s) => f.write_str(s),
            SignalValue::Structured(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("}")
            },
        }
    }
}

impl From<&MmsValue> for SignalValue {
    fn from(value: &MmsValue) -> Self {
        match value {
            MmsValue::Boolean(b) => SignalValue::Bool(*b),
            MmsValue::Integer(v) => SignalValue::Int(*v),
            MmsValue::Unsigned(v) => {
                i64::try_from(*v).map_or(SignalValue::Float(*v as f64), SignalValue::Int)
            },
            MmsValue::Float(v) => SignalValue::Float(*v),
            MmsValue::VisibleString(s) => SignalValue::Text(s.clone()),
            MmsValue::BitString { bits, size } => {
                SignalValue::Text(format!("{:0width$b}", bits, width = usize::from(*size)))
            },
            MmsValue::UtcTime(t) => SignalValue::Text(t.to_rfc3339()),
            MmsValue::Structure(items) => {
                SignalValue::Structured(items.iter().map(SignalValue::from).collect())
            },
        }
    }
}

impl SignalValue {
    /// Convert to an MMS value shaped like `mms_type`
    ///
    /// Values that do not map exactly onto the target type are refused rather
    /// than coerced: a control value must reach the device as entered or not
    /// at all.
    pub fn to_mms(&self, mms_type: Option<MmsType>) -> Result<MmsValue, ControlError> {
        let mismatch = || {
            ControlError::InvalidValue(match mms_type {
                Some(t) => format!("'{self}' is not a valid {t:?} value"),
                None => format!("'{self}' has no wire representation"),
            })
        };
        let value = match (mms_type, self) {
            (Some(MmsType::Boolean), SignalValue::Bool(b)) => MmsValue::Boolean(*b),
            (Some(MmsType::Boolean), SignalValue::Int(v @ (0 | 1))) => MmsValue::Boolean(*v == 1),
            (Some(MmsType::Boolean), SignalValue::Float(v)) if *v == 0.0 || *v == 1.0 => {
                MmsValue::Boolean(*v == 1.0)
            },
            (Some(MmsType::Integer), SignalValue::Bool(b)) => MmsValue::Integer(i64::from(*b)),
            (Some(MmsType::Integer), SignalValue::Int(v)) => MmsValue::Integer(*v),
            (Some(MmsType::Integer), SignalValue::Float(v)) => {
                MmsValue::Integer(integral(*v).ok_or_else(mismatch)?)
            },
            (Some(MmsType::Integer), SignalValue::Text(s)) => {
                MmsValue::Integer(s.trim().parse().map_err(|_| mismatch())?)
            },
            (Some(MmsType::Unsigned), SignalValue::Bool(b)) => MmsValue::Unsigned(u64::from(*b)),
            (Some(MmsType::Unsigned), SignalValue::Int(v)) => {
                MmsValue::Unsigned(u64::try_from(*v).map_err(|_| mismatch())?)
            },
            (Some(MmsType::Unsigned), SignalValue::Float(v)) => {
                let v = integral(*v).ok_or_else(mismatch)?;
                MmsValue::Unsigned(u64::try_from(v).map_err(|_| mismatch())?)
            },
            (Some(MmsType::Unsigned), SignalValue::Text(s)) => {
                MmsValue::Unsigned(s.trim().parse().map_err(|_| mismatch())?)
            },
            (Some(MmsType::Float), SignalValue::Int(v)) => MmsValue::Float(*v as f64),
            (Some(MmsType::Float), SignalValue::Float(v)) => MmsValue::Float(*v),
            (Some(MmsType::Float), SignalValue::Text(s)) => {
                MmsValue::Float(s.trim().parse().map_err(|_| mismatch())?)
            },
            (Some(MmsType::VisibleString), SignalValue::Structured(_)) => return Err(mismatch()),
            (Some(MmsType::VisibleString), v) => MmsValue::VisibleString(v.to_string()),
            (Some(MmsType::Structure) | None, SignalValue::Structured(items)) => {
                MmsValue::Structure(
                    items
                        .iter()
                        .map(|i| i.to_mms(None))
                        .collect::<Result<Vec<_>, _>>()?,
                )
            },
            (Some(_), _) => return Err(mismatch()),
            (None, SignalValue::Bool(b)) => MmsValue::Boolean(*b),
            (None, SignalValue::Int(v)) => MmsValue::Integer(*v),
            (None, SignalValue::Float(v)) => MmsValue::Float(*v),
            (None, SignalValue::Text(s)) => MmsValue::VisibleString(s.clone()),
        };
        Ok(value)
    }
}

/// Exact integer value of a float, if it has one
fn integral(v: f64) -> Option<i64> {
    (v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64).then_some(v as i64)
}

/// Failure outcome of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailure {
    /// Session missing or lost
    NotConnected,
    /// Device answered with an error or the value did not decode
    Invalid,
}

impl From<ReadFailure> for Quality {
    fn from(f: ReadFailure) -> Self {
        match f {
            ReadFailure::NotConnected => Quality::NotConnected,
            ReadFailure::Invalid => Quality::Invalid,
        }
    }
}

/// A single addressable data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Device-local path (`LD/LN.DO.DA` or `unit:fc:address`)
    pub address: String,
    pub name: String,
    pub value: Option<SignalValue>,
    pub quality: Quality,
    /// Time of the last successful update
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: SignalKind,
    pub signal_type: SignalType,
}

impl Signal {
    pub fn new(
        address: impl Into<String>,
        name: impl Into<String>,
        kind: SignalKind,
        signal_type: SignalType,
    ) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            value: None,
            quality: Quality::NotConnected,
            timestamp: None,
            kind,
            signal_type,
        }
    }

    /// Apply a read outcome
    ///
    /// Success replaces value, quality and timestamp together. Failure only
    /// downgrades quality; the old value and its timestamp stay as they were.
    pub fn apply_read(&mut self, outcome: std::result::Result<SignalValue, ReadFailure>) {
        match outcome {
            Ok(value) => {
                self.value = Some(value);
                self.quality = Quality::Good;
                self.timestamp = Some(Utc::now());
            },
            Err(failure) => {
                self.quality = failure.into();
            },
        }
    }

    /// Mark the value as no longer live (device disconnected)
    pub fn mark_stale(&mut self) {
        if self.quality == Quality::Good {
            self.quality = Quality::Stale;
        }
    }

    pub fn fc(&self) -> Option<Fc> {
        match &self.signal_type {
            SignalType::Iec61850 { fc, .. } => Some(*fc),
            SignalType::Modbus { .. } => None,
        }
    }
}
