//! Verdict resolution from a raw execution result.

use juez_common::{ExecutionResult, Verdict};

/// Map an execution result to exactly one verdict.
///
/// Checks run in a fixed order, first match wins:
///
/// 1. judge-side failure -> `InternalError`
/// 2. wall-clock limit hit -> `TimeLimitExceeded`
/// 3. memory limit hit -> `MemoryLimitExceeded`
/// 4. killed by a signal (assertion abort, segfault, ...) -> `RuntimeError`
/// 5. exit status zero with `marker` in stdout -> `Accepted`
/// 6. anything else -> `WrongAnswer`
///
/// The marker is trusted as printed. Submitted code shares the process with
/// the harness, so a submission that prints the marker itself and calls
/// `exit(0)` before any assertion runs is resolved as `Accepted`. Closing
/// that gap needs a channel the submission cannot write to.
pub fn resolve(result: &ExecutionResult, marker: &str) -> Verdict {
    if result.internal_error.is_some() {
        return Verdict::InternalError;
    }
    if result.time_limit_exceeded {
        return Verdict::TimeLimitExceeded;
    }
    if result.memory_limit_exceeded {
        return Verdict::MemoryLimitExceeded;
    }
    if result.signal.is_some() {
        return Verdict::RuntimeError;
    }

    match result.exit_code {
        Some(0) if result.stdout.contains(marker) => Verdict::Accepted,
        Some(_) => Verdict::WrongAnswer,
        // Neither an exit status nor a signal: the wait status was unusable.
        None => Verdict::InternalError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use juez_common::SUCCESS_MARKER;

    fn exited(code: i32, stdout: &str) -> ExecutionResult {
        ExecutionResult {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    fn signalled(signal: i32) -> ExecutionResult {
        ExecutionResult {
            signal: Some(signal),
            ..Default::default()
        }
    }

    #[test]
    fn test_accepted_requires_marker_and_zero_exit() {
        assert_eq!(
            resolve(&exited(0, "All tests passed!\n"), SUCCESS_MARKER),
            Verdict::Accepted
        );
        assert_eq!(resolve(&exited(0, ""), SUCCESS_MARKER), Verdict::WrongAnswer);
        assert_eq!(
            resolve(&exited(1, "All tests passed!\n"), SUCCESS_MARKER),
            Verdict::WrongAnswer
        );
    }

    #[test]
    fn test_signal_is_runtime_error() {
        // SIGABRT from a failed assert
        assert_eq!(resolve(&signalled(6), SUCCESS_MARKER), Verdict::RuntimeError);
        // SIGSEGV
        assert_eq!(resolve(&signalled(11), SUCCESS_MARKER), Verdict::RuntimeError);
    }

    #[test]
    fn test_limits_take_precedence_over_exit_status() {
        let mut result = signalled(9);
        result.time_limit_exceeded = true;
        result.memory_limit_exceeded = true;
        assert_eq!(resolve(&result, SUCCESS_MARKER), Verdict::TimeLimitExceeded);

        result.time_limit_exceeded = false;
        assert_eq!(resolve(&result, SUCCESS_MARKER), Verdict::MemoryLimitExceeded);

        let mut result = exited(0, "All tests passed!");
        result.memory_limit_exceeded = true;
        assert_eq!(resolve(&result, SUCCESS_MARKER), Verdict::MemoryLimitExceeded);
    }

    #[test]
    fn test_internal_error_wins() {
        let mut result = exited(0, "All tests passed!");
        result.time_limit_exceeded = true;
        result.internal_error = Some("spawn failed".into());
        assert_eq!(resolve(&result, SUCCESS_MARKER), Verdict::InternalError);
    }

    #[test]
    fn test_missing_status_is_internal() {
        assert_eq!(
            resolve(&ExecutionResult::default(), SUCCESS_MARKER),
            Verdict::InternalError
        );
    }
}
