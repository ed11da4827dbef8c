//! Error types for the Topology Orchestrator
//!
//! Provides structured error types for every orchestrator component:
//! reconciliation, step graph construction, saga execution, completers,
//! device controllers and the REST surface.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{id}")]
    ResourceNotFound { kind: String, id: String },

    #[error("Resource is inactive: {kind}/{id}")]
    ResourceInactive { kind: String, id: String },

    #[error("Invalid export state for {group}: {reason}")]
    InvalidExportState { group: String, reason: String },

    #[error("No storage port connectivity for initiators [{initiators}] in export group {group}")]
    NoInitiatorConnectivity { initiators: String, group: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Version conflict on export group {group}: expected {expected}, found {actual}")]
    VersionConflict {
        group: String,
        expected: u64,
        actual: u64,
    },

    #[error("Store error: {0}")]
    Store(String),

    // =========================================================================
    // Device Errors
    // =========================================================================
    #[error("Device unavailable: {device}")]
    DeviceUnavailable { device: String },

    #[error("Device operation failed: {device} - {operation}: {reason}")]
    DeviceOperationFailed {
        device: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Workflow Errors
    // =========================================================================
    #[error("Invalid step graph: {0}")]
    InvalidStepGraph(String),

    #[error("Step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Compensation of step {step} failed: {reason}")]
    CompensationFailed { step: String, reason: String },

    #[error("Timed out after {timeout:?} acquiring locks [{keys}]")]
    LockTimeout { keys: String, timeout: Duration },

    #[error("Downstream task {task} did not finish within {timeout:?}")]
    TaskTimeout { task: String, timeout: Duration },

    #[error("Downstream task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // API Errors
    // =========================================================================
    #[error("API request validation failed: {0}")]
    ApiValidation(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error classes reported to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before any step was created
    Validation,
    /// A downstream device reported failure
    Downstream,
    /// A compensating action failed
    Compensation,
    /// A bounded wait expired
    Timeout,
    /// Orchestrator fault
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::Downstream => write!(f, "downstream"),
            ErrorClass::Compensation => write!(f, "compensation"),
            ErrorClass::Timeout => write!(f, "timeout"),
            ErrorClass::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ResourceNotFound { .. }
            | Error::ResourceInactive { .. }
            | Error::InvalidExportState { .. }
            | Error::NoInitiatorConnectivity { .. }
            | Error::Validation(_)
            | Error::InvalidStepGraph(_)
            | Error::ApiValidation(_) => ErrorClass::Validation,

            Error::DeviceUnavailable { .. }
            | Error::DeviceOperationFailed { .. }
            | Error::StepFailed { .. }
            | Error::TaskFailed { .. }
            | Error::VersionConflict { .. } => ErrorClass::Downstream,

            Error::CompensationFailed { .. } => ErrorClass::Compensation,

            Error::TaskTimeout { .. } | Error::LockTimeout { .. } => ErrorClass::Timeout,

            _ => ErrorClass::Internal,
        }
    }

    /// Check if this error was raised before any mutation
    pub fn is_validation(&self) -> bool {
        self.class() == ErrorClass::Validation
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::DeviceUnavailable { .. }
                | Error::LockTimeout { .. }
                | Error::VersionConflict { .. }
        )
    }

    pub(crate) fn not_found(kind: impl std::fmt::Display, id: impl std::fmt::Display) -> Self {
        Error::ResourceNotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn inactive(kind: impl std::fmt::Display, id: impl std::fmt::Display) -> Self {
        Error::ResourceInactive {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;
