//! Common error types and classification
//!
//! Shared error vocabulary for tether crates:
//!
//! 1. **`CommonError`**: failures that show up in more than one layer
//!    (configuration, serialization, file persistence).
//!
//! 2. **`ErrorClassification` trait**: a uniform way to ask any error whether
//!    it is retryable, how severe it is, and whether it needs attention.
//!
//! 3. **`ErrorSeverity` enum**: one severity scale for logging decisions.
//!
//! Layer-specific errors embed `CommonError` through a transparent
//! `Common(#[from] CommonError)` variant instead of duplicating it.
//!
//! ## ErrorSeverity Levels
//!
//! | Level | Use Case | Examples |
//! |-------|----------|----------|
//! | **Info** | Expected conditions | No session, user cancelled login |
//! | **Warning** | Degraded but operational | Transient network failure during renewal |
//! | **Error** | Failure requiring attention | Invalid configuration, rejected grant |
//! | **Critical** | Integrity at risk | Reserved for invariant violations |

use std::fmt;
use std::time::Duration;

/// Standard result type using CommonError
pub type CommonResult<T> = Result<T, CommonError>;

/// Common error variants that appear across multiple modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Configuration-related errors
    Config { message: String, field: Option<String> },

    /// Serialization or deserialization errors
    Serialization { message: String, format: Option<String> },

    /// File persistence errors
    Persistence { message: String },
}

impl fmt::Display for CommonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message, field } => {
                if let Some(field) = field {
                    write!(f, "Configuration error in field '{}': {}", field, message)
                } else {
                    write!(f, "Configuration error: {}", message)
                }
            }
            Self::Serialization { message, format } => {
                if let Some(format) = format {
                    write!(f, "Serialization error ({}): {}", format, message)
                } else {
                    write!(f, "Serialization error: {}", message)
                }
            }
            Self::Persistence { message } => write!(f, "Persistence error: {}", message),
        }
    }
}

impl std::error::Error for CommonError {}

impl ErrorClassification for CommonError {
    // Every variant needs a change of input, not a retry.
    fn is_retryable(&self) -> bool {
        false
    }

    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Error
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl CommonError {
    /// Create a simple configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), field: None }
    }

    /// Create a configuration error for a specific field
    pub fn config_field<S: Into<String>, F: Into<String>>(field: F, message: S) -> Self {
        Self::Config { message: message.into(), field: Some(field.into()) }
    }

    /// Create a serialization error with format information
    pub fn serialization_format<S: Into<String>, F: Into<String>>(format: F, message: S) -> Self {
        Self::Serialization { message: message.into(), format: Some(format.into()) }
    }

    /// Create a persistence error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence { message: message.into() }
    }
}

/// Error classification trait for consistent error handling across modules
///
/// Lets the session layer decide between "retry later" and "force
/// re-authentication" without matching on concrete error types.
pub trait ErrorClassification {
    /// Check if this error is retryable
    ///
    /// Retryable errors are transient: network timeouts, provider 5xx
    /// responses, temporary connectivity loss.
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

// Standard conversions from common error types
impl From<serde_json::Error> for CommonError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_format("JSON", err.to_string())
    }
}

impl From<std::io::Error> for CommonError {
    fn from(err: std::io::Error) -> Self {
        Self::persistence(err.to_string())
    }
}

impl From<toml::de::Error> for CommonError {
    fn from(err: toml::de::Error) -> Self {
        Self::serialization_format("TOML", err.to_string())
    }
}
