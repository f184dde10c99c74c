//! Error taxonomy for requests that never reach a verdict.

use thiserror::Error;

/// Errors raised before a grading attempt produces a verdict.
///
/// Everything that happens after the exercise has been found (compile
/// failures, crashes, limits, judge faults) is reported as a
/// [`Verdict`](crate::types::Verdict) instead.
#[derive(Error, Debug)]
pub enum JudgeError {
    /// Unknown or disabled exercise
    #[error("Not found: {0}")]
    NotFound(String),

    /// Submission rejected before grading
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl JudgeError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            JudgeError::NotFound(_) => 404,
            JudgeError::ValidationError(_) => 422,
        }
    }

    /// Returns the error code string for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            JudgeError::NotFound(_) => "NOT_FOUND",
            JudgeError::ValidationError(_) => "VALIDATION_ERROR",
        }
    }
}

/// Result type alias using JudgeError
pub type JudgeResult<T> = Result<T, JudgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(JudgeError::NotFound("x".into()).status_code(), 404);
        assert_eq!(JudgeError::ValidationError("x".into()).status_code(), 422);
        assert_eq!(JudgeError::ValidationError("x".into()).error_code(), "VALIDATION_ERROR");
    }
}
