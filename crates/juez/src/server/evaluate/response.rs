//! Evaluation response DTOs.

use juez_common::Verdict;
use serde::Serialize;
use uuid::Uuid;

use crate::grader::GradeReport;

/// POST /evaluate response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    pub submission_id: Uuid,
    /// `completed` when the program ran, `error` otherwise
    pub status: &'static str,
    pub verdict: Verdict,
    pub compilation: CompilationSummary,
    pub execution: ExecutionSummary,
    pub score: u32,
    /// Whole attempt, e.g. `0.412s`
    pub execution_time: String,
    /// Peak resident memory, e.g. `1536 KB`
    pub memory_usage: String,
    pub diagnostics: Option<String>,
    pub exercise_version: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct CompilationSummary {
    pub success: bool,
    /// Compiler warnings
    pub output: String,
    pub errors: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub total_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    pub test_results: Vec<TestResult>,
}

/// The harness is a single test; its assertions are not reported separately.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_number: u32,
    pub passed: bool,
    pub execution_time: String,
    pub error: Option<String>,
}

impl From<&GradeReport> for EvaluateResponse {
    fn from(report: &GradeReport) -> Self {
        let ran = report.execution.is_some() && report.verdict != Verdict::InternalError;
        let passed = report.verdict.is_accepted();

        let compilation = CompilationSummary {
            success: report.compiled(),
            output: report.compiler_output.clone(),
            errors: if report.compiled() {
                None
            } else {
                report.diagnostics.clone()
            },
        };

        let execution = match &report.execution {
            Some(run) if ran => ExecutionSummary {
                total_tests: 1,
                passed_tests: u32::from(passed),
                failed_tests: u32::from(!passed),
                test_results: vec![TestResult {
                    test_number: 1,
                    passed,
                    execution_time: seconds(run.duration_ms),
                    error: report.diagnostics.clone(),
                }],
            },
            _ => ExecutionSummary {
                total_tests: 0,
                passed_tests: 0,
                failed_tests: 0,
                test_results: Vec::new(),
            },
        };

        let peak_kb = report
            .execution
            .as_ref()
            .map(|run| run.peak_memory_kb)
            .unwrap_or(0);

        Self {
            submission_id: report.submission_id,
            status: if ran { "completed" } else { "error" },
            verdict: report.verdict,
            compilation,
            execution,
            score: report.score,
            execution_time: seconds(report.total_ms),
            memory_usage: if peak_kb > 0 {
                format!("{peak_kb} KB")
            } else {
                "N/A".to_string()
            },
            diagnostics: report.diagnostics.clone(),
            exercise_version: report.exercise_version.clone(),
            timestamp: report.finished_at.to_rfc3339(),
        }
    }
}

fn seconds(ms: u64) -> String {
    format!("{:.3}s", ms as f64 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use juez_common::{ExecutionResult, ExerciseId, Limits};

    fn report(verdict: Verdict, execution: Option<ExecutionResult>) -> GradeReport {
        GradeReport {
            submission_id: Uuid::new_v4(),
            exercise_id: ExerciseId::new(1, 1),
            exercise_version: "abc".into(),
            verdict,
            diagnostics: (!verdict.is_accepted()).then(|| "boom".to_string()),
            compiler_output: String::new(),
            execution,
            limits: Limits::default(),
            total_ms: 1234,
            score: if verdict.is_accepted() { 100 } else { 0 },
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_accepted_response() {
        let run = ExecutionResult {
            exit_code: Some(0),
            duration_ms: 15,
            peak_memory_kb: 1536,
            ..Default::default()
        };
        let response = EvaluateResponse::from(&report(Verdict::Accepted, Some(run)));
        assert_eq!(response.status, "completed");
        assert_eq!(response.score, 100);
        assert_eq!(response.execution.passed_tests, 1);
        assert_eq!(response.execution.test_results[0].execution_time, "0.015s");
        assert_eq!(response.execution_time, "1.234s");
        assert_eq!(response.memory_usage, "1536 KB");
        assert!(response.compilation.success);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["verdict"], "ACCEPTED");
        assert_eq!(json["execution"]["totalTests"], 1);
    }

    #[test]
    fn test_compile_error_response() {
        let response = EvaluateResponse::from(&report(Verdict::CompileError, None));
        assert_eq!(response.status, "error");
        assert!(!response.compilation.success);
        assert_eq!(response.compilation.errors.as_deref(), Some("boom"));
        assert_eq!(response.execution.total_tests, 0);
        assert_eq!(response.memory_usage, "N/A");
    }

    #[test]
    fn test_runtime_error_counts_as_failed_test() {
        let run = ExecutionResult {
            signal: Some(6),
            ..Default::default()
        };
        let response = EvaluateResponse::from(&report(Verdict::RuntimeError, Some(run)));
        assert_eq!(response.status, "completed");
        assert_eq!(response.execution.failed_tests, 1);
        assert_eq!(response.execution.test_results[0].error.as_deref(), Some("boom"));
    }
}
