//! Common types used across juez crates.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signature::FunctionSignature;

/// Submission ID type
pub type SubmissionId = Uuid;

/// Text a reference harness prints once every assertion has passed.
pub const SUCCESS_MARKER: &str = "All tests passed!";

/// Identifies an exercise by guide and exercise number.
///
/// The canonical text form is `guide-<g>/exercise-<e>`; `<g>/<e>` is also
/// accepted when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExerciseId {
    pub guide: u32,
    pub exercise: u32,
}

impl ExerciseId {
    pub fn new(guide: u32, exercise: u32) -> Self {
        Self { guide, exercise }
    }

    /// Harness location relative to a tests base directory
    pub fn harness_path(&self) -> PathBuf {
        PathBuf::from(format!("guide-{}", self.guide)).join(format!("exercise-{}.c", self.exercise))
    }

    /// Sidecar metadata location relative to a tests base directory
    pub fn metadata_path(&self) -> PathBuf {
        PathBuf::from(format!("guide-{}", self.guide))
            .join(format!("exercise-{}.json", self.exercise))
    }
}

impl fmt::Display for ExerciseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guide-{}/exercise-{}", self.guide, self.exercise)
    }
}

impl FromStr for ExerciseId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (guide, exercise) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid exercise id: {s}"))?;
        let guide = guide.strip_prefix("guide-").unwrap_or(guide);
        let exercise = exercise.strip_prefix("exercise-").unwrap_or(exercise);

        match (guide.parse(), exercise.parse()) {
            (Ok(guide), Ok(exercise)) => Ok(Self { guide, exercise }),
            _ => Err(format!("invalid exercise id: {s}")),
        }
    }
}

impl TryFrom<String> for ExerciseId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExerciseId> for String {
    fn from(id: ExerciseId) -> Self {
        id.to_string()
    }
}

/// A registered exercise. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    pub id: ExerciseId,
    /// Trusted reference harness (C source with `main`)
    pub test_source: String,
    /// Function the learner must implement
    pub signature: FunctionSignature,
    /// Disabled exercises are hidden from lookups
    pub enabled: bool,
    /// Content version (SHA-256 of the harness, hex)
    pub version: String,
}

/// Supported submission languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    C,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::C => write!(f, "c"),
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" => Ok(Language::C),
            other => Err(format!("unsupported language: {other}")),
        }
    }
}

/// Learner submission for one grading attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub exercise_id: ExerciseId,
    pub language: Language,
    pub source: String,
}

impl Submission {
    /// New C submission with a fresh id
    pub fn new(exercise_id: ExerciseId, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            exercise_id,
            language: Language::C,
            source: source.into(),
        }
    }
}

/// Resource limits for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    /// Wall-clock timeout in milliseconds
    pub timeout_ms: u64,
    /// Maximum resident memory in bytes
    pub max_memory_bytes: u64,
    /// Cap on captured stdout and stderr, each
    pub max_output_bytes: u64,
}

impl Limits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Clamp every limit to at most the matching field of `max`.
    pub fn clamped_to(&self, max: &Limits) -> Limits {
        Limits {
            timeout_ms: self.timeout_ms.min(max.timeout_ms),
            max_memory_bytes: self.max_memory_bytes.min(max.max_memory_bytes),
            max_output_bytes: self.max_output_bytes.min(max.max_output_bytes),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            timeout_ms: 5_000,
            max_memory_bytes: 256 * 1024 * 1024,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Final outcome of grading one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Every assertion passed and the marker was printed
    Accepted,
    /// Submission did not build
    CompileError,
    /// Built but crashed or trapped
    RuntimeError,
    /// Exited cleanly without the success marker, or with a nonzero status
    WrongAnswer,
    /// Exceeded time limit
    TimeLimitExceeded,
    /// Exceeded memory limit
    MemoryLimitExceeded,
    /// Judge-side failure
    InternalError,
}

impl Verdict {
    /// Get short code for verdict
    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::CompileError => "CE",
            Verdict::RuntimeError => "RE",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::MemoryLimitExceeded => "MLE",
            Verdict::InternalError => "IE",
        }
    }

    /// Human readable summary
    pub fn description(&self) -> &'static str {
        match self {
            Verdict::Accepted => "All tests passed",
            Verdict::CompileError => "Code failed to compile",
            Verdict::RuntimeError => "Program crashed or an assertion failed",
            Verdict::WrongAnswer => "Program finished without passing every test",
            Verdict::TimeLimitExceeded => "Time limit exceeded",
            Verdict::MemoryLimitExceeded => "Memory limit exceeded",
            Verdict::InternalError => "Internal judge error",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Raw outcome of running a compiled artifact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit status; `None` when the process was killed or signalled
    pub exit_code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Captured stdout or stderr hit the output cap
    pub output_truncated: bool,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Highest resident set observed, in KiB
    pub peak_memory_kb: u64,
    pub time_limit_exceeded: bool,
    pub memory_limit_exceeded: bool,
    /// Judge-side failure; never shown to the learner
    pub internal_error: Option<String>,
}

impl ExecutionResult {
    /// Result for a run that failed on the judge side
    pub fn internal(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            internal_error: Some(message.into()),
            duration_ms,
            ..Default::default()
        }
    }

    /// Whether the process exited on its own with status zero
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exercise_id_round_trip_forms() {
        let id: ExerciseId = "guide-1/exercise-2".parse().unwrap();
        assert_eq!(id, ExerciseId::new(1, 2));
        assert_eq!("3/4".parse::<ExerciseId>().unwrap(), ExerciseId::new(3, 4));
        assert_eq!(id.to_string(), "guide-1/exercise-2");
        assert!("guide-x/exercise-1".parse::<ExerciseId>().is_err());
        assert!("12".parse::<ExerciseId>().is_err());
    }

    #[test]
    fn test_exercise_id_paths() {
        let id = ExerciseId::new(1, 2);
        assert_eq!(id.harness_path(), PathBuf::from("guide-1/exercise-2.c"));
        assert_eq!(id.metadata_path(), PathBuf::from("guide-1/exercise-2.json"));
    }

    #[test]
    fn test_exercise_id_serializes_as_string() {
        let json = serde_json::to_string(&ExerciseId::new(1, 1)).unwrap();
        assert_eq!(json, "\"guide-1/exercise-1\"");
    }

    #[test]
    fn test_limits_clamp() {
        let max = Limits { timeout_ms: 1000, max_memory_bytes: 1024, max_output_bytes: 10 };
        let asked = Limits { timeout_ms: 5000, max_memory_bytes: 512, max_output_bytes: 100 };
        let clamped = asked.clamped_to(&max);
        assert_eq!(clamped.timeout_ms, 1000);
        assert_eq!(clamped.max_memory_bytes, 512);
        assert_eq!(clamped.max_output_bytes, 10);
    }

    #[test]
    fn test_limits_serde_uses_camel_case() {
        let json = serde_json::to_value(Limits::default()).unwrap();
        assert!(json.get("timeoutMs").is_some());
        assert!(json.get("maxMemoryBytes").is_some());
        assert!(json.get("maxOutputBytes").is_some());
    }

    #[test]
    fn test_verdict_codes() {
        assert_eq!(Verdict::Accepted.code(), "AC");
        assert_eq!(Verdict::TimeLimitExceeded.to_string(), "TLE");
        let json = serde_json::to_string(&Verdict::CompileError).unwrap();
        assert_eq!(json, "\"COMPILE_ERROR\"");
    }

    #[test]
    fn test_language_parse() {
        assert_eq!("C".parse::<Language>().unwrap(), Language::C);
        assert!("python".parse::<Language>().is_err());
    }
}
