//! Error handling primitives shared across the core.
//!
//! Every variant maps to a stable [`CoreCode`] so the C ABI and log lines can
//! carry a machine parsable number next to the human message.

/// Stable error codes that cross the FFI boundary.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CoreCode {
    /// Success code used as a sentinel.
    Ok = 0,
    /// Correction payload or descriptor failed validation.
    InvalidInput = 1,
    /// A storage-level guard rejected a racing write.
    Conflict = 2,
    /// A training run failed.
    ExecutionFailed = 3,
    /// Selection found no eligible run.
    NoCandidate = 4,
    /// Backend I/O failure; retryable.
    StorageUnavailable = 5,
    /// Requested entity does not exist.
    NotFound = 6,
    /// Configuration could not be loaded or validated.
    Config = 7,
}

/// Canonical error type for the core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("training execution failed: {0}")]
    ExecutionFailure(String),

    #[error("no model available yet for {filter}")]
    NoCandidate { filter: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Validation helper.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Conflict helper.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    /// Execution failure helper used by trainers.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::ExecutionFailure(msg.into())
    }

    /// Storage helper.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    /// Not-found helper.
    pub fn not_found(what: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            what,
            key: key.to_string(),
        }
    }

    /// Configuration helper.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Stable code for this error.
    pub fn code(&self) -> CoreCode {
        match self {
            CoreError::Validation(_) => CoreCode::InvalidInput,
            CoreError::ConcurrencyConflict(_) => CoreCode::Conflict,
            CoreError::ExecutionFailure(_) => CoreCode::ExecutionFailed,
            CoreError::NoCandidate { .. } => CoreCode::NoCandidate,
            CoreError::StorageUnavailable(_) => CoreCode::StorageUnavailable,
            CoreError::NotFound { .. } => CoreCode::NotFound,
            CoreError::Config(_) => CoreCode::Config,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ConcurrencyConflict(_) | CoreError::StorageUnavailable(_)
        )
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => CoreError::ConcurrencyConflict(err.to_string()),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                CoreError::ConcurrencyConflict(err.to_string())
            }
            _ => CoreError::StorageUnavailable(err.to_string()),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::StorageUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::StorageUnavailable(format!("decode: {err}"))
    }
}
