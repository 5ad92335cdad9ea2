//! Unified error hierarchy for glucowatch
//!
//! Boundary validation failures, calculation anomalies, and configuration
//! problems are separated so callers can tell a rejected input from a
//! degraded-but-usable analysis result.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Top-level error type for all glucowatch operations
#[derive(Debug, Error)]
pub enum GlucoWatchError {
    /// Input rejected at the boundary; never enters the data model
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Numerical analysis failure; callers fall back, cycles never abort
    #[error("Calculation error: {0}")]
    Calculation(#[from] CalculationError),

    /// Configuration load/validation errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Storage collaborator errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Boundary validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Glucose value outside the physiological band accepted by the window
    #[error("Reading {value} mg/dL outside accepted range {min}-{max}")]
    ReadingOutOfRange { value: u16, min: u16, max: u16 },

    /// Dose or intake amounts must be strictly positive
    #[error("Amount must be positive, got {amount}")]
    NonPositiveAmount { amount: Decimal },

    /// Overrides may be zero but never negative
    #[error("Override amount may not be negative, got {amount}")]
    NegativeAmount { amount: Decimal },

    /// Amount exceeds the configured safety limit
    #[error("Amount {amount} exceeds limit of {limit}")]
    AmountOutOfRange { amount: Decimal, limit: Decimal },

    /// Free-text amount that could not be parsed as a decimal quantity
    #[error("Could not parse amount from {input:?}")]
    UnparsableAmount { input: String },

    /// Readings must arrive in strictly increasing timestamp order
    #[error("Reading timestamp {new} is not after last accepted {last}")]
    NonMonotonicTimestamp {
        last: DateTime<Utc>,
        new: DateTime<Utc>,
    },
}

/// Calculation anomalies
///
/// These are caught locally and answered with a fallback method or a
/// low-confidence result; they never fail an analysis cycle.
#[derive(Debug, Error)]
pub enum CalculationError {
    /// Not enough readings for the requested calculation
    #[error("Insufficient data for {calculation}: need {required}, have {actual}")]
    InsufficientData {
        calculation: String,
        required: usize,
        actual: usize,
    },

    /// Fit could not be computed (singular system, identical timestamps)
    #[error("Degenerate fit in {method}: {reason}")]
    DegenerateFit { method: String, reason: String },

    /// Intermediate value left the representable range
    #[error("Numerical instability in {calculation}")]
    NumericalInstability { calculation: String },
}

/// Result type alias for glucowatch operations
pub type Result<T> = std::result::Result<T, GlucoWatchError>;

impl GlucoWatchError {
    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            GlucoWatchError::Validation(_) => ErrorSeverity::Warning,
            GlucoWatchError::Calculation(_) => ErrorSeverity::Warning,
            GlucoWatchError::Configuration(_) => ErrorSeverity::Error,
            GlucoWatchError::Storage(_) => ErrorSeverity::Error,
            GlucoWatchError::Io(_) => ErrorSeverity::Error,
            GlucoWatchError::Internal(_) => ErrorSeverity::Critical,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            GlucoWatchError::Validation(ValidationError::ReadingOutOfRange {
                value,
                min,
                max,
            }) => {
                format!(
                    "Sensor reading {} mg/dL was discarded (accepted range is {}-{} mg/dL).",
                    value, min, max
                )
            }
            GlucoWatchError::Validation(ValidationError::NonPositiveAmount { .. }) => {
                "Logged amounts must be greater than zero.".to_string()
            }
            GlucoWatchError::Validation(ValidationError::UnparsableAmount { input }) => {
                format!("Could not read {:?} as a number. Try e.g. 2.4 or 2,4.", input)
            }
            GlucoWatchError::Calculation(CalculationError::InsufficientData {
                calculation,
                ..
            }) => {
                format!(
                    "Not enough readings yet to compute {}. Results will improve as data accumulates.",
                    calculation
                )
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents an operation but the monitor can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
        }
    }
}
