//! Evaluation handlers.

use axum::{Json, extract::State};
use validator::Validate;

use crate::server::error::{ApiError, ApiResult};
use crate::server::state::AppState;

use super::request::EvaluateRequest;
use super::response::EvaluateResponse;

/// POST /evaluate - Grade a submission against its exercise
pub async fn evaluate(
    State(state): State<AppState>,
    Json(payload): Json<EvaluateRequest>,
) -> ApiResult<Json<EvaluateResponse>> {
    payload
        .validate()
        .map_err(|e| ApiError::Validation(format!("{}", e)))?;

    let limits = payload.limits(state.grader.default_limits());
    let submission = payload.into_submission()?;

    tracing::info!(
        submission_id = %submission.id,
        exercise_id = %submission.exercise_id,
        source_bytes = submission.source.len(),
        "Evaluation requested"
    );

    let report = state
        .grader
        .grade(&submission, Some(limits), state.shutdown.clone())
        .await?;

    Ok(Json(EvaluateResponse::from(&report)))
}
