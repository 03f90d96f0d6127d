use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::subscription::UsageError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreErrorCode {
    InvalidArgument,
    NotFound,
    Internal,
    Unavailable,
    PermissionDenied,
    FailedPrecondition,
    Aborted,
}

impl StoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreErrorCode::InvalidArgument => "docstore/invalid-argument",
            StoreErrorCode::NotFound => "docstore/not-found",
            StoreErrorCode::Internal => "docstore/internal",
            StoreErrorCode::Unavailable => "docstore/unavailable",
            StoreErrorCode::PermissionDenied => "docstore/permission-denied",
            StoreErrorCode::FailedPrecondition => "docstore/failed-precondition",
            StoreErrorCode::Aborted => "docstore/aborted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreError {
    pub code: StoreErrorCode,
    message: String,
}

impl StoreError {
    pub fn new(code: StoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for StoreError {}

impl From<UsageError> for StoreError {
    fn from(value: UsageError) -> Self {
        failed_precondition(value.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub fn invalid_argument(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::InvalidArgument, message)
}

pub fn not_found(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::NotFound, message)
}

pub fn internal_error(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::Internal, message)
}

pub fn unavailable(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::Unavailable, message)
}

pub fn permission_denied(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::PermissionDenied, message)
}

pub fn failed_precondition(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::Aborted, message)
}
