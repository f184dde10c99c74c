//! Exercise handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};
use juez_common::ExerciseId;

use crate::server::error::ApiResult;
use crate::server::state::AppState;

use super::response::{ExerciseListResponse, ExerciseSummary};

/// GET /exercises - List enabled exercises
pub async fn list_exercises(State(state): State<AppState>) -> Json<ExerciseListResponse> {
    let exercises: Vec<ExerciseSummary> = state
        .grader
        .registry()
        .list()
        .map(|exercise| ExerciseSummary::from(exercise.as_ref()))
        .collect();

    Json(ExerciseListResponse {
        total: exercises.len(),
        exercises,
    })
}

/// GET /tests/{guide}/{exercise} - Download the reference harness
pub async fn download_test(
    State(state): State<AppState>,
    Path((guide, exercise)): Path<(u32, u32)>,
) -> ApiResult<impl IntoResponse> {
    let exercise = state
        .grader
        .registry()
        .lookup(&ExerciseId::new(guide, exercise))?;

    let disposition = format!("attachment; filename=\"exercise-{}.c\"", exercise.id.exercise);

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        exercise.test_source.clone(),
    ))
}
