//! Unified error handling for the scout workspace
//!
//! This crate provides the error type returned by the shared bootstrap code,
//! plus the classification trait every domain error implements so that logs
//! and command output can treat them uniformly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ErrorInfo - machine-readable error report
// ============================================================================

/// Error report printed by the CLI in `--json` mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g. `SELECT_REJECTED`)
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    /// Whether an operator retry is worthwhile
    pub retryable: bool,
    /// Underlying protocol error code, when the device answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_code: Option<i32>,
}

impl ErrorInfo {
    /// Report for an error that carries no classification
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self {
            code: "UNKNOWN_ERROR".to_string(),
            message: message.into(),
            category: ErrorCategory::Unknown,
            retryable: false,
            protocol_code: None,
        }
    }

    pub fn with_protocol_code(mut self, code: Option<i32>) -> Self {
        self.protocol_code = code;
        self
    }
}

// ============================================================================
// ScoutError - bootstrap error type
// ============================================================================

/// Error raised while loading configuration or other shared resources
#[derive(Debug, Error)]
pub enum ScoutError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using ScoutError
pub type ScoutResult<T> = Result<T, ScoutError>;

impl From<figment::Error> for ScoutError {
    fn from(err: figment::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl ScoutErrorTrait for ScoutError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Io(_) => ErrorCategory::Internal,
        }
    }
}

// ============================================================================
// Error classification trait
// ============================================================================

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Network,
    Timeout,

    // Input layer
    Validation,
    NotFound,

    // Protocol/communication layer
    Protocol,
    Connection,

    // System level
    Internal,
    ResourceBusy,

    // Others
    Unknown,
}

/// Error capability trait
///
/// Each crate keeps its own domain error type (e.g. `ControlError`) and gains a
/// common outward-facing interface by implementing this trait.
///
/// Note that `is_retryable` is advisory only: the control state machine never
/// retries on its own, retry policy belongs to the caller.
pub trait ScoutErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for logs and JSON output)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// Whether the error is worth retrying by an operator (category-based default)
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::ResourceBusy
        )
    }

    /// Get log level
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal => Level::ERROR,
            ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Connection
            | ErrorCategory::Protocol => Level::WARN,
            ErrorCategory::Validation | ErrorCategory::NotFound => Level::INFO,
            _ => Level::WARN,
        }
    }

    /// Build a machine-readable report
    fn error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.error_code().to_string(),
            message: self.to_string(),
            category: self.category(),
            retryable: self.is_retryable(),
            protocol_code: None,
        }
    }
}
