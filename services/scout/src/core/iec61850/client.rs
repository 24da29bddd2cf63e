//! MMS client seam
//!
//! The IEC 61850 stack (association, MMS encoding, TCP) lives behind
//! [`MmsClient`] and [`ControlObjectClient`]. Everything above this module only
//! sees object references, functional constraints and [`MmsValue`]s.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::control::{ControlModel, Originator};

// ============================================================================
// Error codes
// ============================================================================

/// Client error codes as reported by the MMS stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IedErrorCode {
    Ok,
    NotConnected,
    AlreadyConnected,
    ConnectionLost,
    ServiceNotSupported,
    ConnectionRejected,
    OutstandingCallLimit,
    UserProvidedInvalidArgument,
    ObjectReferenceInvalid,
    UnexpectedValueReceived,
    Timeout,
    AccessDenied,
    ObjectDoesNotExist,
    ObjectExists,
    ObjectAccessUnsupported,
    TypeInconsistent,
    TemporarilyUnavailable,
    ObjectUndefined,
    InvalidAddress,
    HardwareFault,
    TypeUnsupported,
    ObjectAttributeInconsistent,
    ObjectValueInvalid,
    ObjectInvalidated,
    MalformedMessage,
    ServiceNotImplemented,
    Unknown,
}

impl IedErrorCode {
    /// Numeric code
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::NotConnected => 1,
            Self::AlreadyConnected => 2,
            Self::ConnectionLost => 3,
            Self::ServiceNotSupported => 4,
            Self::ConnectionRejected => 5,
            Self::OutstandingCallLimit => 6,
            Self::UserProvidedInvalidArgument => 10,
            Self::ObjectReferenceInvalid => 12,
            Self::UnexpectedValueReceived => 13,
            Self::Timeout => 20,
            Self::AccessDenied => 21,
            Self::ObjectDoesNotExist => 22,
            Self::ObjectExists => 23,
            Self::ObjectAccessUnsupported => 24,
            Self::TypeInconsistent => 25,
            Self::TemporarilyUnavailable => 26,
            Self::ObjectUndefined => 27,
            Self::InvalidAddress => 28,
            Self::HardwareFault => 29,
            Self::TypeUnsupported => 30,
            Self::ObjectAttributeInconsistent => 31,
            Self::ObjectValueInvalid => 32,
            Self::ObjectInvalidated => 33,
            Self::MalformedMessage => 34,
            Self::ServiceNotImplemented => 98,
            Self::Unknown => 99,
        }
    }

    /// Reverse lookup; unlisted codes map to `Unknown`
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::NotConnected,
            2 => Self::AlreadyConnected,
            3 => Self::ConnectionLost,
            4 => Self::ServiceNotSupported,
            5 => Self::ConnectionRejected,
            6 => Self::OutstandingCallLimit,
            10 => Self::UserProvidedInvalidArgument,
            12 => Self::ObjectReferenceInvalid,
            13 => Self::UnexpectedValueReceived,
            20 => Self::Timeout,
            21 => Self::AccessDenied,
            22 => Self::ObjectDoesNotExist,
            23 => Self::ObjectExists,
            24 => Self::ObjectAccessUnsupported,
            25 => Self::TypeInconsistent,
            26 => Self::TemporarilyUnavailable,
            27 => Self::ObjectUndefined,
            28 => Self::InvalidAddress,
            29 => Self::HardwareFault,
            30 => Self::TypeUnsupported,
            31 => Self::ObjectAttributeInconsistent,
            32 => Self::ObjectValueInvalid,
            33 => Self::ObjectInvalidated,
            34 => Self::MalformedMessage,
            98 => Self::ServiceNotImplemented,
            _ => Self::Unknown,
        }
    }

    /// Session-level failure (not a refusal by the remote object)
    pub fn is_connection_error(self) -> bool {
        matches!(self, Self::NotConnected | Self::ConnectionLost)
    }
}

impl fmt::Display for IedErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}={}", self, self.code())
    }
}

/// Error returned by an MMS client call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {context}")]
pub struct IedError {
    pub code: IedErrorCode,
    pub context: String,
}

impl IedError {
    pub fn new(code: IedErrorCode, context: impl Into<String>) -> Self {
        Self {
            code,
            context: context.into(),
        }
    }

    pub fn not_connected() -> Self {
        Self::new(IedErrorCode::NotConnected, "no active association")
    }

    pub fn timeout(context: impl Into<String>) -> Self {
        Self::new(IedErrorCode::Timeout, context)
    }

    pub fn object_not_found(reference: impl Into<String>) -> Self {
        Self::new(IedErrorCode::ObjectDoesNotExist, reference)
    }
}

// ============================================================================
// Functional constraints
// ============================================================================

/// IEC 61850 functional constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Fc {
    /// Status information
    St,
    /// Measurands
    Mx,
    /// Setpoint
    Sp,
    /// Substitution
    Sv,
    /// Configuration
    Cf,
    /// Description
    Dc,
    /// Setting group
    Sg,
    /// Setting group editable
    Se,
    /// Service response
    Sr,
    /// Operate received
    Or,
    /// Blocking
    Bl,
    /// Extended definition
    Ex,
    /// Control
    Co,
}

impl Fc {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fc::St => "ST",
            Fc::Mx => "MX",
            Fc::Sp => "SP",
            Fc::Sv => "SV",
            Fc::Cf => "CF",
            Fc::Dc => "DC",
            Fc::Sg => "SG",
            Fc::Se => "SE",
            Fc::Sr => "SR",
            Fc::Or => "OR",
            Fc::Bl => "BL",
            Fc::Ex => "EX",
            Fc::Co => "CO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_uppercase().as_str() {
            "ST" => Fc::St,
            "MX" => Fc::Mx,
            "SP" => Fc::Sp,
            "SV" => Fc::Sv,
            "CF" => Fc::Cf,
            "DC" => Fc::Dc,
            "SG" => Fc::Sg,
            "SE" => Fc::Se,
            "SR" => Fc::Sr,
            "OR" => Fc::Or,
            "BL" => Fc::Bl,
            "EX" => Fc::Ex,
            "CO" => Fc::Co,
            _ => return None,
        })
    }
}

impl fmt::Display for Fc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Values
// ============================================================================

/// Wire type of an attribute, as reported by the data directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MmsType {
    Boolean,
    Integer,
    Unsigned,
    Float,
    VisibleString,
    BitString,
    UtcTime,
    Structure,
}

/// Decoded MMS value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MmsValue {
    Boolean(bool),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    VisibleString(String),
    /// Bits are stored MSB-first in the low `size` bits of `bits`
    BitString { bits: u32, size: u8 },
    UtcTime(DateTime<Utc>),
    Structure(Vec<MmsValue>),
}

impl MmsValue {
    pub fn mms_type(&self) -> MmsType {
        match self {
            MmsValue::Boolean(_) => MmsType::Boolean,
            MmsValue::Integer(_) => MmsType::Integer,
            MmsValue::Unsigned(_) => MmsType::Unsigned,
            MmsValue::Float(_) => MmsType::Float,
            MmsValue::VisibleString(_) => MmsType::VisibleString,
            MmsValue::BitString { .. } => MmsType::BitString,
            MmsValue::UtcTime(_) => MmsType::UtcTime,
            MmsValue::Structure(_) => MmsType::Structure,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MmsValue::Integer(v) => Some(*v),
            MmsValue::Unsigned(v) => i64::try_from(*v).ok(),
            MmsValue::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            MmsValue::Boolean(b) => Some(*b),
            MmsValue::Integer(v) => Some(*v != 0),
            MmsValue::Unsigned(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MmsValue::Float(v) => Some(*v),
            MmsValue::Integer(v) => Some(*v as f64),
            MmsValue::Unsigned(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Element `index` of a structure
    pub fn element(&self, index: usize) -> Option<&MmsValue> {
        match self {
            MmsValue::Structure(items) => items.get(index),
            _ => None,
        }
    }
}

/// One entry of a data directory listing
#[derive(Debug, Clone, PartialEq)]
pub struct DataAttributeInfo {
    pub name: String,
    /// Absent for nested structure members that inherit the parent's FC
    pub fc: Option<Fc>,
    pub mms_type: MmsType,
}

impl DataAttributeInfo {
    pub fn new(name: impl Into<String>, fc: Option<Fc>, mms_type: MmsType) -> Self {
        Self {
            name: name.into(),
            fc,
            mms_type,
        }
    }
}

// ============================================================================
// Client traits
// ============================================================================

/// Parameters attached to every control action
#[derive(Debug, Clone, PartialEq)]
pub struct ControlParameters {
    pub originator: Originator,
    pub ctl_num: u8,
    pub test: bool,
    pub interlock_check: bool,
    pub synchro_check: bool,
}

/// Connected MMS association to one IED
///
/// Implementations do not apply timeouts; callers bound every call.
#[async_trait]
pub trait MmsClient: Send + Sync {
    /// Establish the association
    async fn connect(&self) -> Result<(), IedError>;

    /// Release the association
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Logical device names
    async fn logical_devices(&self) -> Result<Vec<String>, IedError>;

    /// Logical node names under a logical device. Some firmware returns
    /// names already prefixed with `LD/`.
    async fn logical_nodes(&self, logical_device: &str) -> Result<Vec<String>, IedError>;

    /// Data object names under `LD/LN`
    async fn data_objects(&self, logical_node_ref: &str) -> Result<Vec<String>, IedError>;

    /// Attribute directory of a data object or structured attribute
    async fn data_directory(&self, reference: &str) -> Result<Vec<DataAttributeInfo>, IedError>;

    async fn read_value(&self, reference: &str, fc: Fc) -> Result<MmsValue, IedError>;

    async fn write_value(&self, reference: &str, fc: Fc, value: MmsValue) -> Result<(), IedError>;

    /// Instantiate the high-level control client for `LD/LN.DO`
    ///
    /// Real stacks read the control model and type information during
    /// instantiation, so this can fail on objects that are perfectly
    /// controllable through raw writes.
    async fn create_control_object(
        &self,
        object_ref: &str,
    ) -> Result<Box<dyn ControlObjectClient>, IedError>;
}

/// High-level control client bound to one data object
#[async_trait]
pub trait ControlObjectClient: Send + Sync {
    fn object_reference(&self) -> &str;

    /// Control model as seen by the client stack
    fn control_model(&self) -> ControlModel;

    /// Apply origin, control number and check flags for the next action
    fn set_parameters(&mut self, params: &ControlParameters);

    /// SELECT for normal security
    async fn select(&mut self) -> Result<(), IedError>;

    /// SELECT-WITH-VALUE for enhanced security
    async fn select_with_value(&mut self, value: &MmsValue) -> Result<(), IedError>;

    async fn operate(&mut self, value: &MmsValue) -> Result<(), IedError>;

    async fn cancel(&mut self) -> Result<(), IedError>;
}
