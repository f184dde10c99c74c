//! Grading attempts: lookup, compile, run, resolve.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use juez_common::{
    ExecutionResult, Exercise, ExerciseId, JudgeError, JudgeResult, Limits, Submission, SubmissionId,
    SUCCESS_MARKER, Verdict,
};
use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::cancel::CancelSignal;
use crate::compiler::{CompileError, Compiler};
use crate::config::{Config, ExecutionConfig};
use crate::executor::Executor;
use crate::metrics;
use crate::registry::Registry;
use crate::text;
use crate::verdict;

/// Cap on each stdout/stderr excerpt quoted in diagnostics
const EXCERPT_LIMIT_BYTES: usize = 4 * 1024;

const INTERNAL_ERROR_MESSAGE: &str = "The judge could not evaluate this submission. Please try again.";

/// Outcome of one grading attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeReport {
    pub submission_id: SubmissionId,
    pub exercise_id: ExerciseId,
    /// Harness version the submission was graded against
    pub exercise_version: String,
    pub verdict: Verdict,
    /// Learner-facing explanation, absent on Accepted
    pub diagnostics: Option<String>,
    /// Compiler warnings from a successful build
    pub compiler_output: String,
    /// Raw run outcome, absent when nothing ran
    pub execution: Option<ExecutionResult>,
    pub limits: Limits,
    /// Whole attempt, compile included
    pub total_ms: u64,
    pub score: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl GradeReport {
    pub fn compiled(&self) -> bool {
        self.verdict != Verdict::CompileError
    }
}

/// Everything decided while the attempt ran
struct Outcome {
    verdict: Verdict,
    diagnostics: Option<String>,
    compiler_output: String,
    execution: Option<ExecutionResult>,
}

impl Outcome {
    fn internal() -> Self {
        Self {
            verdict: Verdict::InternalError,
            diagnostics: Some(INTERNAL_ERROR_MESSAGE.to_string()),
            compiler_output: String::new(),
            execution: None,
        }
    }
}

/// Grades submissions against registered exercises
pub struct Grader {
    registry: Arc<Registry>,
    compiler: Compiler,
    executor: Executor,
    execution: ExecutionConfig,
    permits: Semaphore,
}

impl Grader {
    pub fn new(
        registry: Arc<Registry>,
        compiler: Compiler,
        executor: Executor,
        execution: ExecutionConfig,
    ) -> Self {
        let permits = Semaphore::new(execution.max_parallel_attempts.max(1));
        Self {
            registry,
            compiler,
            executor,
            execution,
            permits,
        }
    }

    pub fn from_config(config: &Config, registry: Arc<Registry>) -> Self {
        Self::new(
            registry,
            Compiler::new(
                config.compiler.clone(),
                &config.storage.workspace_root,
                config.sandbox.clone(),
            ),
            Executor::new(config.sandbox.clone()),
            config.execution.clone(),
        )
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn default_limits(&self) -> Limits {
        self.execution.default_limits
    }

    /// Requested limits clamped to the configured maxima, defaults otherwise.
    pub fn effective_limits(&self, requested: Option<Limits>) -> Limits {
        requested
            .unwrap_or(self.execution.default_limits)
            .clamped_to(&self.execution.max_limits)
    }

    /// Grade one submission.
    ///
    /// Returns an error only when the request is invalid or the exercise is
    /// unknown; every attempt past that point yields exactly one verdict.
    pub async fn grade(
        &self,
        submission: &Submission,
        limits: Option<Limits>,
        cancel: CancelSignal,
    ) -> JudgeResult<GradeReport> {
        self.validate(submission)?;
        if let Some(requested) = &limits {
            validate_limits(requested)?;
        }
        let exercise = self.registry.lookup(&submission.exercise_id)?;
        let limits = self.effective_limits(limits);

        let started_at = Utc::now();
        let clock = Instant::now();

        let outcome = tokio::select! {
            permit = self.permits.acquire() => match permit {
                Ok(_permit) => {
                    let _active = metrics::ActiveAttempt::start();
                    self.attempt(submission, &exercise, &limits, &cancel).await
                }
                Err(_) => {
                    error!(submission_id = %submission.id, "Grader semaphore closed");
                    Outcome::internal()
                }
            },
            _ = cancel.cancelled() => {
                warn!(submission_id = %submission.id, "Attempt cancelled while queued");
                Outcome::internal()
            }
        };

        let total_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        let peak_memory_kb = outcome
            .execution
            .as_ref()
            .map(|e| e.peak_memory_kb)
            .unwrap_or(0);

        metrics::record_verdict(outcome.verdict);
        metrics::record_attempt(
            &exercise.id.to_string(),
            total_ms as f64 / 1000.0,
            peak_memory_kb * 1024,
        );

        info!(
            submission_id = %submission.id,
            exercise_id = %exercise.id,
            verdict = %outcome.verdict,
            total_ms,
            peak_memory_kb,
            "Submission graded"
        );

        Ok(GradeReport {
            submission_id: submission.id,
            exercise_id: exercise.id,
            exercise_version: exercise.version.clone(),
            verdict: outcome.verdict,
            diagnostics: outcome.diagnostics,
            compiler_output: outcome.compiler_output,
            execution: outcome.execution,
            limits,
            total_ms,
            score: if outcome.verdict.is_accepted() { 100 } else { 0 },
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn validate(&self, submission: &Submission) -> JudgeResult<()> {
        if submission.source.trim().is_empty() {
            return Err(JudgeError::ValidationError(
                "source code is empty".to_string(),
            ));
        }
        if submission.source.len() > self.execution.max_source_bytes {
            return Err(JudgeError::ValidationError(format!(
                "source code exceeds {} bytes",
                self.execution.max_source_bytes
            )));
        }
        if submission.source.contains('\0') {
            return Err(JudgeError::ValidationError(
                "source code contains NUL bytes".to_string(),
            ));
        }
        Ok(())
    }

    async fn attempt(
        &self,
        submission: &Submission,
        exercise: &Exercise,
        limits: &Limits,
        cancel: &CancelSignal,
    ) -> Outcome {
        let artifact = match self
            .compiler
            .compile(submission.id, &submission.source, exercise, cancel)
            .await
        {
            Ok(artifact) => artifact,
            Err(err) if err.is_submission_fault() => {
                return Outcome {
                    verdict: Verdict::CompileError,
                    diagnostics: Some(err.diagnostics()),
                    compiler_output: String::new(),
                    execution: None,
                };
            }
            Err(CompileError::Cancelled) => {
                warn!(submission_id = %submission.id, "Attempt cancelled during compilation");
                return Outcome::internal();
            }
            Err(err) => {
                error!(submission_id = %submission.id, error = %err, "Compilation failed on the judge side");
                return Outcome::internal();
            }
        };

        let execution = self.executor.run(&artifact, limits, cancel).await;
        let compiler_output = artifact.warnings().to_string();
        if let Err(e) = artifact.dispose() {
            warn!(submission_id = %submission.id, error = %e, "Failed to remove workspace");
        }

        let verdict = verdict::resolve(&execution, SUCCESS_MARKER);
        if let Some(reason) = &execution.internal_error {
            error!(submission_id = %submission.id, %reason, "Execution failed on the judge side");
        }

        Outcome {
            verdict,
            diagnostics: diagnostics_for(verdict, &execution, limits),
            compiler_output,
            execution: Some(execution),
        }
    }
}

/// Zero limits cannot be met by any program.
fn validate_limits(limits: &Limits) -> JudgeResult<()> {
    let zero = [
        ("timeout", limits.timeout_ms),
        ("memory limit", limits.max_memory_bytes),
        ("output limit", limits.max_output_bytes),
    ]
    .into_iter()
    .find(|(_, value)| *value == 0);

    match zero {
        Some((name, _)) => Err(JudgeError::ValidationError(format!("{name} must be positive"))),
        None => Ok(()),
    }
}

/// Learner-facing explanation of a run verdict.
pub fn diagnostics_for(verdict: Verdict, execution: &ExecutionResult, limits: &Limits) -> Option<String> {
    match verdict {
        Verdict::Accepted => None,
        Verdict::TimeLimitExceeded => Some(format!(
            "Time limit exceeded: the program ran longer than {} ms",
            limits.timeout_ms
        )),
        Verdict::MemoryLimitExceeded => Some(format!(
            "Memory limit exceeded: peak usage {} KB, limit {} KB",
            execution.peak_memory_kb,
            limits.max_memory_bytes / 1024
        )),
        Verdict::InternalError => Some(INTERNAL_ERROR_MESSAGE.to_string()),
        Verdict::RuntimeError | Verdict::WrongAnswer | Verdict::CompileError => {
            Some(failure_message(execution))
        }
    }
}

/// "Process exited with code N. stderr: ... stdout: ..."
fn failure_message(execution: &ExecutionResult) -> String {
    let mut message = match (execution.signal, execution.exit_code) {
        (Some(signal), _) => format!("Process terminated by signal {}", signal_name(signal)),
        (None, Some(0)) => format!("Process exited with code 0 without printing \"{SUCCESS_MARKER}\""),
        (None, Some(code)) => format!("Process exited with code {code}"),
        (None, None) => "Process terminated".to_string(),
    };

    for (label, stream) in [("stderr", &execution.stderr), ("stdout", &execution.stdout)] {
        let trimmed = stream.trim();
        if !trimmed.is_empty() {
            message.push_str(&format!(
                ". {label}: {}",
                text::truncate(trimmed, EXCERPT_LIMIT_BYTES)
            ));
        }
    }
    if execution.output_truncated {
        message.push_str(" (output truncated)");
    }
    message
}

fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("{signal}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_message_for_assertion_abort() {
        let execution = ExecutionResult {
            signal: Some(6),
            stderr: "program: harness.c:9: main: Assertion `multiplyByTwo(2) == 4' failed.\n".into(),
            ..Default::default()
        };
        let message = failure_message(&execution);
        assert!(message.starts_with("Process terminated by signal SIGABRT"));
        assert!(message.contains("stderr: program: harness.c:9"));
        assert!(!message.contains("stdout:"));
    }

    #[test]
    fn test_failure_message_for_exit_codes() {
        let execution = ExecutionResult {
            exit_code: Some(3),
            stdout: "partial\n".into(),
            ..Default::default()
        };
        assert_eq!(
            failure_message(&execution),
            "Process exited with code 3. stdout: partial"
        );

        let execution = ExecutionResult {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(failure_message(&execution).contains("without printing"));
    }

    #[test]
    fn test_limit_diagnostics() {
        let limits = Limits {
            timeout_ms: 1000,
            max_memory_bytes: 64 * 1024 * 1024,
            max_output_bytes: 1024,
        };
        let execution = ExecutionResult {
            peak_memory_kb: 70_000,
            ..Default::default()
        };
        let tle = diagnostics_for(Verdict::TimeLimitExceeded, &execution, &limits).unwrap();
        assert!(tle.contains("1000 ms"));
        let mle = diagnostics_for(Verdict::MemoryLimitExceeded, &execution, &limits).unwrap();
        assert!(mle.contains("70000 KB"));
        assert!(mle.contains("65536 KB"));
        assert!(diagnostics_for(Verdict::Accepted, &execution, &limits).is_none());
    }

    #[test]
    fn test_internal_diagnostics_hide_details() {
        let execution = ExecutionResult::internal("fork: Resource temporarily unavailable", 3);
        let message = diagnostics_for(Verdict::InternalError, &execution, &Limits::default()).unwrap();
        assert!(!message.contains("fork"));
    }
}
