//! Unified error handling for shl
//!
//! This module provides a centralized error type for every layer of the
//! library. It implements error categorization for:
//! - User errors (bad shapes, bad params, bad configuration)
//! - Dispatch errors (no kernel registered, callback not resolved)
//! - Internal errors (bugs, poisoned locks)
//! - Model errors (binary model file I/O and parsing)
//!
//! Every error also maps onto the C-compatible [`Status`] code that the
//! operator API reports (`UNSUPPORT_DTYPE`, `CALLBACK_UNSET`, ...).

use std::fmt;

// Re-export thiserror for convenience
pub use thiserror;

/// Status codes returned by operator `init` and invoke wrappers.
///
/// The numeric values are part of the external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    UnsupportedLayout = -3,
    UnsupportedDtype = -2,
    CallbackUnset = -1,
    False = 0,
    True = 1,
}

impl Status {
    /// Raw integer value of the status.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == Status::True
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::UnsupportedLayout => "UNSUPPORT_LAYOUT",
            Status::UnsupportedDtype => "UNSUPPORT_DTYPE",
            Status::CallbackUnset => "CALLBACK_UNSET",
            Status::False => "FALSE",
            Status::True => "TRUE",
        };
        write!(f, "{}({})", name, self.code())
    }
}

/// Unified error type for shl
///
/// This enum consolidates all domain-specific errors into a single type
/// that can be used throughout the codebase. It supports categorization
/// via the `category()` method and status-code mapping via
/// `status_code()`.
#[derive(Debug, thiserror::Error)]
pub enum ShlError {
    // ========== Dispatch Errors ==========
    /// No kernel registered for this dtype
    #[error("Unsupported dtype {dtype} for {op} on {api}")]
    UnsupportedDtype {
        op: String,
        api: String,
        dtype: String,
    },

    /// Backend has no kernel for this operator at any dtype
    #[error("No {op} kernel registered on {api}")]
    KernelNotFound { op: String, api: String },

    /// Operator given a layout it cannot handle
    #[error("Unsupported layout {layout} for {op}")]
    UnsupportedLayout { op: String, layout: String },

    /// Operator invoked before a successful init
    #[error("Callback unset for {0}: init was not called or failed")]
    CallbackUnset(String),

    /// Input dtype differs from the dtype the cached kernel was bound to
    #[error("Dtype mismatch for {op}: kernel bound to {expected}, got {actual}")]
    DtypeMismatch {
        op: String,
        expected: String,
        actual: String,
    },

    // ========== Shape Errors ==========
    /// Invalid tensor or operator shape
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// More dimensions than a tensor descriptor can hold
    #[error("Too many dimensions: {actual} > {max}")]
    TooManyDims { max: usize, actual: usize },

    /// Buffer element count does not match the tensor shape
    #[error("Buffer size mismatch: expected {expected} elements, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    /// Tensor has no data buffer attached
    #[error("Tensor has no data: {0}")]
    MissingData(String),

    /// Input/output slot index out of range
    #[error("Index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// Invalid operator parameter
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    // ========== Quantization Errors ==========
    /// Scale is not a finite positive number
    #[error("Invalid quantization scale: {0}")]
    InvalidScale(f64),

    /// Quantized tensor without quantization records
    #[error("Missing quantization info: {0}")]
    MissingQuantInfo(String),

    // ========== Session Errors ==========
    /// Lifecycle call made in the wrong session state
    #[error("Invalid session state for {op}: {state}")]
    InvalidState { op: String, state: String },

    /// No session backend registered for (api, run mode)
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Operation not supported by this backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid session configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Model Errors ==========
    /// Invalid or corrupted binary model file
    #[error("Invalid model file: {0}")]
    InvalidModelFile(String),

    /// Session snapshot (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ========== I/O Errors ==========
    /// File I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (indicates a bug or concurrent access issue)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ShlError {
    /// Convenience constructor for [`ShlError::UnsupportedDtype`]
    pub fn unsupported_dtype(
        op: impl fmt::Display,
        api: impl fmt::Display,
        dtype: impl fmt::Display,
    ) -> Self {
        ShlError::UnsupportedDtype {
            op: op.to_string(),
            api: api.to_string(),
            dtype: dtype.to_string(),
        }
    }

    /// Convenience constructor for [`ShlError::UnsupportedLayout`]
    pub fn unsupported_layout(op: impl fmt::Display, layout: impl fmt::Display) -> Self {
        ShlError::UnsupportedLayout {
            op: op.to_string(),
            layout: layout.to_string(),
        }
    }

    /// Convenience constructor for [`ShlError::InvalidState`]
    pub fn invalid_state(op: &str, state: impl fmt::Display) -> Self {
        ShlError::InvalidState {
            op: op.to_string(),
            state: state.to_string(),
        }
    }

    /// Map the error onto the operator status code
    ///
    /// Errors outside the dispatch taxonomy report `Status::False`,
    /// the generic backend failure value.
    pub fn status_code(&self) -> Status {
        match self {
            ShlError::UnsupportedDtype { .. }
            | ShlError::KernelNotFound { .. }
            | ShlError::DtypeMismatch { .. } => Status::UnsupportedDtype,
            ShlError::UnsupportedLayout { .. } => Status::UnsupportedLayout,
            ShlError::CallbackUnset(_) => Status::CallbackUnset,
            _ => Status::False,
        }
    }

    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            // User errors - bad input or configuration
            ShlError::InvalidShape(_)
            | ShlError::TooManyDims { .. }
            | ShlError::BufferSizeMismatch { .. }
            | ShlError::MissingData(_)
            | ShlError::IndexOutOfRange { .. }
            | ShlError::InvalidParam(_)
            | ShlError::InvalidScale(_)
            | ShlError::MissingQuantInfo(_)
            | ShlError::InvalidState { .. }
            | ShlError::InvalidConfiguration(_) => ErrorCategory::User,

            // Dispatch errors - registry has no answer
            ShlError::UnsupportedDtype { .. }
            | ShlError::KernelNotFound { .. }
            | ShlError::UnsupportedLayout { .. }
            | ShlError::CallbackUnset(_)
            | ShlError::DtypeMismatch { .. }
            | ShlError::BackendUnavailable(_)
            | ShlError::Unsupported(_) => ErrorCategory::Dispatch,

            // Model errors - file issues
            ShlError::InvalidModelFile(_)
            | ShlError::Serialization(_)
            | ShlError::IoError(_) => ErrorCategory::Model,

            ShlError::InternalError(_) | ShlError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is a dispatch error (no kernel for the request)
    pub fn is_dispatch_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Dispatch)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// Categories help determine how to handle errors:
/// - User: fix the tensors, params or config
/// - Dispatch: pick another backend or dtype
/// - Internal: log and report as bug
/// - Model: file or model problems
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// User error - invalid input or configuration
    User,
    /// Dispatch error - no kernel or backend for the request
    Dispatch,
    /// Internal error - indicates a bug
    Internal,
    /// Model error - file or model issue
    Model,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Dispatch => write!(f, "Dispatch"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Model => write!(f, "Model"),
        }
    }
}

// Note: From<std::io::Error> and From<serde_json::Error> come from #[from]

impl<T> From<std::sync::PoisonError<T>> for ShlError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ShlError::LockPoisoned(err.to_string())
    }
}

// Helper type alias for Results using ShlError
pub type ShlResult<T> = std::result::Result<T, ShlError>;

// ========== Helper Functions ==========

/// Create a shape error with context
///
/// # Examples
/// ```ignore
/// return Err(shape_error!("kernel has {} dims, expected 4", k.dim_count()));
/// ```
#[macro_export]
macro_rules! shape_error {
    ($msg:expr) => {
        $crate::error::ShlError::InvalidShape($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ShlError::InvalidShape(format!($fmt, $($arg)*))
    };
}

/// Create a parameter error with context
#[macro_export]
macro_rules! param_error {
    ($msg:expr) => {
        $crate::error::ShlError::InvalidParam($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ShlError::InvalidParam(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("packed kernel missing after init"));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::ShlError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ShlError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Wrap an error with additional context
///
/// # Examples
/// ```ignore
/// let v = risky().map_err(|e| context(e, "during kernel packing"))?;
/// ```
pub fn context<E>(err: E, msg: &str) -> ShlError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ShlError::InternalError(format!("{}: {}", msg, err))
}

/// Wrap an IO error with context
///
/// # Examples
/// ```ignore
/// let bytes = std::fs::read(path).map_err(|e| io_context(e, "reading binary model"))?;
/// ```
pub fn io_context(err: std::io::Error, msg: &str) -> ShlError {
    ShlError::IoError(std::io::Error::new(err.kind(), format!("{}: {}", msg, err)))
}

/// Convert an option to a result with an internal error
pub fn internal_err(msg: &str) -> ShlError {
    ShlError::InternalError(msg.to_string())
}

/// Fail with a shape error unless `cond` holds
pub fn ensure_shape(cond: bool, msg: impl FnOnce() -> String) -> ShlResult<()> {
    if cond {
        Ok(())
    } else {
        Err(ShlError::InvalidShape(msg()))
    }
}
