use thiserror::Error;

/// Equity accounting errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EquityError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The unit of work could not commit. Nothing was left visible; callers may retry.
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl EquityError {
    pub fn already_approved(milestone_id: impl std::fmt::Display) -> Self {
        Self::Conflict(format!("milestone {} already approved", milestone_id))
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageFailure(message.into())
    }

    /// Stable machine-readable code used by API surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::StorageFailure(_) => "STORAGE_FAILURE",
        }
    }
}

pub type EquityResult<T> = Result<T, EquityError>;
