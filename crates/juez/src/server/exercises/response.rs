//! Exercise response DTOs.

use juez_common::Exercise;
use serde::Serialize;

/// One entry of GET /exercises
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseSummary {
    pub id: String,
    pub guide_number: u32,
    pub exercise_number: u32,
    /// Prototype the submission must define
    pub function_signature: String,
    pub version: String,
}

impl From<&Exercise> for ExerciseSummary {
    fn from(exercise: &Exercise) -> Self {
        Self {
            id: exercise.id.to_string(),
            guide_number: exercise.id.guide,
            exercise_number: exercise.id.exercise,
            function_signature: exercise.signature.to_string(),
            version: exercise.version.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExerciseListResponse {
    pub exercises: Vec<ExerciseSummary>,
    pub total: usize,
}
