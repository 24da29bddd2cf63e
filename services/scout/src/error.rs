//! Error handling for the scout protocol core
//!
//! `ScoutSrvError` is the general service error. Control operations surface the
//! narrower `ControlError` taxonomy so callers can branch on the exact failure
//! kind, while transport calls report `IedError` (see `core::iec61850::client`).

use errors::{ErrorCategory, ErrorInfo, ScoutError, ScoutErrorTrait};
use thiserror::Error;

use crate::core::iec61850::client::{IedError, IedErrorCode};
use crate::core::iec61850::control::ControlModel;

/// Scout service error type
#[derive(Error, Debug, Clone)]
pub enum ScoutSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Protocol communication errors
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Data handling errors (parsing, conversion, codec)
    #[error("Data error: {0}")]
    DataError(String),

    /// Device registry errors (unknown device, duplicate name, worker gone)
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Validation errors (invalid parameter, conflicting options)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Control operation failed
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the scout core
pub type Result<T> = std::result::Result<T, ScoutSrvError>;

impl ScoutSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        ScoutSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        ScoutSrvError::IoError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ScoutSrvError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        ScoutSrvError::ConnectionError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ScoutSrvError::TimeoutError(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        ScoutSrvError::DataError(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        ScoutSrvError::DeviceError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ScoutSrvError::ValidationError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ScoutSrvError::InternalError(msg.into())
    }

    pub fn device_not_found(name: impl std::fmt::Display) -> Self {
        ScoutSrvError::DeviceError(format!("Device not found: {}", name))
    }

    pub fn signal_not_found(address: impl std::fmt::Display) -> Self {
        ScoutSrvError::DataError(format!("Signal not found: {}", address))
    }

    pub fn not_connected() -> Self {
        ScoutSrvError::ConnectionError("Not connected".to_string())
    }
}

// ============================================================================
// Control error taxonomy
// ============================================================================

/// Typed failure of a control operation
///
/// Never retried by the control engine; the caller owns retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// No active session with the device
    #[error("not connected")]
    NotConnected,

    /// A network round-trip exceeded its configured bound
    #[error("timed out waiting for device response")]
    Timeout,

    /// Address does not resolve to an object on the device
    #[error("invalid object reference: {0}")]
    InvalidReference(String),

    /// The control client could not be instantiated for the object
    #[error("control object unavailable: {0}")]
    ControlObjectUnavailable(String),

    /// Device refused the SELECT
    #[error("select rejected ({0})")]
    SelectRejected(IedErrorCode),

    /// Device refused the OPERATE
    #[error("operate rejected ({0})")]
    OperateRejected(IedErrorCode),

    /// Device refused the CANCEL
    #[error("cancel rejected ({0})")]
    CancelRejected(IedErrorCode),

    /// OPERATE on a select-before-operate model without a live selection
    #[error("operate requires a prior successful select")]
    NotSelected,

    /// A selection is already outstanding for this object
    #[error("object is already selected")]
    AlreadySelected,

    /// Explicit SELECT requested on a model without a select step
    #[error("select not applicable to control model {0}")]
    SelectNotApplicable(ControlModel),

    /// The object is status-only
    #[error("object is not controllable (status-only)")]
    NotControllable,

    /// The command value cannot be expressed as the control value's wire type
    #[error("invalid control value: {0}")]
    InvalidValue(String),
}

impl ControlError {
    /// Map a failed SELECT transport call
    pub fn from_select(err: &IedError) -> Self {
        Self::classify(err).unwrap_or(Self::SelectRejected(err.code))
    }

    /// Map a failed OPERATE transport call
    pub fn from_operate(err: &IedError) -> Self {
        Self::classify(err).unwrap_or(Self::OperateRejected(err.code))
    }

    /// Map a failed CANCEL transport call
    pub fn from_cancel(err: &IedError) -> Self {
        Self::classify(err).unwrap_or(Self::CancelRejected(err.code))
    }

    fn classify(err: &IedError) -> Option<Self> {
        match err.code {
            IedErrorCode::Timeout => Some(Self::Timeout),
            IedErrorCode::NotConnected | IedErrorCode::ConnectionLost => Some(Self::NotConnected),
            _ => None,
        }
    }

    /// Underlying protocol error code, when the device answered
    pub fn protocol_code(&self) -> Option<i32> {
        match self {
            Self::SelectRejected(c) | Self::OperateRejected(c) | Self::CancelRejected(c) => {
                Some(c.code())
            },
            _ => None,
        }
    }
}

impl ScoutErrorTrait for ControlError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotConnected => "NOT_CONNECTED",
            Self::Timeout => "TIMEOUT",
            Self::InvalidReference(_) => "INVALID_REFERENCE",
            Self::ControlObjectUnavailable(_) => "CONTROL_OBJECT_UNAVAILABLE",
            Self::SelectRejected(_) => "SELECT_REJECTED",
            Self::OperateRejected(_) => "OPERATE_REJECTED",
            Self::CancelRejected(_) => "CANCEL_REJECTED",
            Self::NotSelected => "NOT_SELECTED",
            Self::AlreadySelected => "ALREADY_SELECTED",
            Self::SelectNotApplicable(_) => "SELECT_NOT_APPLICABLE",
            Self::NotControllable => "NOT_CONTROLLABLE",
            Self::InvalidValue(_) => "INVALID_VALUE",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::NotConnected => ErrorCategory::Connection,
            Self::Timeout => ErrorCategory::Timeout,
            Self::InvalidReference(_) => ErrorCategory::NotFound,
            Self::ControlObjectUnavailable(_)
            | Self::SelectRejected(_)
            | Self::OperateRejected(_)
            | Self::CancelRejected(_) => ErrorCategory::Protocol,
            Self::AlreadySelected => ErrorCategory::ResourceBusy,
            Self::NotSelected
            | Self::SelectNotApplicable(_)
            | Self::NotControllable
            | Self::InvalidValue(_) => ErrorCategory::Validation,
        }
    }

    fn error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.error_code().to_string(),
            message: self.to_string(),
            category: self.category(),
            retryable: self.is_retryable(),
            protocol_code: None,
        }
        .with_protocol_code(self.protocol_code())
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for ScoutSrvError {
    fn from(err: std::io::Error) -> Self {
        ScoutSrvError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ScoutSrvError {
    fn from(err: serde_json::Error) -> Self {
        ScoutSrvError::DataError(format!("JSON: {err}"))
    }
}

impl From<csv::Error> for ScoutSrvError {
    fn from(err: csv::Error) -> Self {
        ScoutSrvError::DataError(format!("CSV: {err}"))
    }
}

impl From<figment::Error> for ScoutSrvError {
    fn from(err: figment::Error) -> Self {
        ScoutSrvError::ConfigError(err.to_string())
    }
}

impl From<ScoutError> for ScoutSrvError {
    fn from(err: ScoutError) -> Self {
        match err {
            ScoutError::Configuration(msg) => ScoutSrvError::ConfigError(msg),
            ScoutError::Io(e) => ScoutSrvError::IoError(e.to_string()),
        }
    }
}

impl From<voltage_modbus::ModbusError> for ScoutSrvError {
    fn from(err: voltage_modbus::ModbusError) -> Self {
        ScoutSrvError::ProtocolError(format!("Modbus: {err}"))
    }
}

impl From<IedError> for ScoutSrvError {
    fn from(err: IedError) -> Self {
        match err.code {
            IedErrorCode::Timeout => ScoutSrvError::TimeoutError(err.to_string()),
            IedErrorCode::NotConnected | IedErrorCode::ConnectionLost => {
                ScoutSrvError::ConnectionError(err.to_string())
            },
            _ => ScoutSrvError::ProtocolError(err.to_string()),
        }
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn io_error(self, msg: &str) -> Result<T>;
    fn protocol_error(self, msg: &str) -> Result<T>;
    fn connection_error(self, msg: &str) -> Result<T>;
    fn data_error(self, msg: &str) -> Result<T>;
    fn context(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| ScoutSrvError::ConfigError(format!("{msg}: {e}")))
    }

    fn io_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| ScoutSrvError::IoError(format!("{msg}: {e}")))
    }

    fn protocol_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| ScoutSrvError::ProtocolError(format!("{msg}: {e}")))
    }

    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| ScoutSrvError::ConnectionError(format!("{msg}: {e}")))
    }

    fn data_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| ScoutSrvError::DataError(format!("{msg}: {e}")))
    }

    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| ScoutSrvError::InternalError(format!("{msg}: {e}")))
    }
}

impl ScoutErrorTrait for ScoutSrvError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "SCOUT_CONFIG_ERROR",
            Self::IoError(_) => "SCOUT_IO_ERROR",
            Self::ProtocolError(_) => "SCOUT_PROTOCOL_ERROR",
            Self::ConnectionError(_) => "SCOUT_CONNECTION_ERROR",
            Self::TimeoutError(_) => "SCOUT_TIMEOUT",
            Self::DataError(_) => "SCOUT_DATA_ERROR",
            Self::DeviceError(_) => "SCOUT_DEVICE_ERROR",
            Self::ValidationError(_) => "SCOUT_VALIDATION_ERROR",
            Self::Control(e) => e.error_code(),
            Self::InternalError(_) => "SCOUT_INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigError(_) => ErrorCategory::Configuration,
            Self::IoError(_) => ErrorCategory::Internal,
            Self::ProtocolError(_) => ErrorCategory::Protocol,
            Self::ConnectionError(_) => ErrorCategory::Connection,
            Self::TimeoutError(_) => ErrorCategory::Timeout,
            Self::DataError(_) => ErrorCategory::Validation,
            Self::DeviceError(_) => ErrorCategory::NotFound,
            Self::ValidationError(_) => ErrorCategory::Validation,
            Self::Control(e) => e.category(),
            Self::InternalError(_) => ErrorCategory::Internal,
        }
    }

    fn error_info(&self) -> ErrorInfo {
        let protocol_code = match self {
            Self::Control(e) => e.protocol_code(),
            _ => None,
        };
        ErrorInfo {
            code: self.error_code().to_string(),
            message: self.to_string(),
            category: self.category(),
            retryable: self.is_retryable(),
            protocol_code,
        }
    }
}
