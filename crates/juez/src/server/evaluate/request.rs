//! Evaluation request DTOs.

use juez_common::{ExerciseId, Language, Limits, Submission};
use serde::Deserialize;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::server::error::{ApiError, ApiResult};

const MIB: u64 = 1024 * 1024;

/// POST /evaluate body
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    /// Caller-chosen id, echoed back; generated when absent
    pub submission_id: Option<Uuid>,

    #[validate(range(min = 1, message = "guideNumber must be at least 1"))]
    pub guide_number: u32,

    #[validate(range(min = 1, message = "exerciseNumber must be at least 1"))]
    pub exercise_number: u32,

    #[validate(
        length(min = 1, max = 1048576, message = "Source code must be 1-1048576 characters"),
        custom(function = "no_nul_bytes")
    )]
    pub code: String,

    pub language: Option<String>,

    /// Wall-clock limit in milliseconds
    #[validate(range(min = 1, max = 3600000, message = "timeout must be 1-3600000 ms"))]
    pub timeout: Option<u64>,

    /// Memory limit in MiB
    #[validate(range(min = 1, max = 1048576, message = "memoryLimit must be 1-1048576 MiB"))]
    pub memory_limit: Option<u64>,
}

fn no_nul_bytes(code: &str) -> Result<(), ValidationError> {
    if code.contains('\0') {
        return Err(ValidationError::new("nul_byte").with_message("Source code contains NUL bytes".into()));
    }
    Ok(())
}

impl EvaluateRequest {
    pub fn exercise_id(&self) -> ExerciseId {
        ExerciseId::new(self.guide_number, self.exercise_number)
    }

    /// Requested limits, falling back to `defaults` field by field
    pub fn limits(&self, defaults: Limits) -> Limits {
        Limits {
            timeout_ms: self.timeout.unwrap_or(defaults.timeout_ms),
            max_memory_bytes: self
                .memory_limit
                .map(|mib| mib.saturating_mul(MIB))
                .unwrap_or(defaults.max_memory_bytes),
            max_output_bytes: defaults.max_output_bytes,
        }
    }

    pub fn into_submission(self) -> ApiResult<Submission> {
        let language = self
            .language
            .as_deref()
            .unwrap_or("c")
            .parse::<Language>()
            .map_err(ApiError::Validation)?;

        Ok(Submission {
            id: self.submission_id.unwrap_or_else(Uuid::new_v4),
            exercise_id: self.exercise_id(),
            language,
            source: self.code,
        })
    }
}
