//! Compiles a submission together with its exercise harness.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use juez_common::{Exercise, FunctionSignature, SubmissionId};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::config::CompilerConfig;
use crate::sandbox::{ProcessGroupGuard, SandboxPolicy};
use crate::text;
use crate::workspace::Workspace;

/// Learner translation unit inside the workspace
pub const SUBMISSION_FILE: &str = "submission.c";
/// Reference harness translation unit inside the workspace
pub const HARNESS_FILE: &str = "harness.c";
/// Linked program inside the workspace
pub const BINARY_NAME: &str = "program";

#[derive(Error, Debug)]
pub enum CompileError {
    /// The compiler rejected the code
    #[error("compilation failed")]
    Rejected { diagnostics: String },

    #[error("Compilation timed out")]
    TimedOut,

    #[error("compilation cancelled")]
    Cancelled,

    /// Judge-side failure: compiler missing, workspace unusable, ...
    #[error("compiler unavailable: {0}")]
    Internal(String),
}

impl CompileError {
    /// Whether the learner's code is to blame
    pub fn is_submission_fault(&self) -> bool {
        matches!(self, CompileError::Rejected { .. } | CompileError::TimedOut)
    }

    /// Text shown to the learner
    pub fn diagnostics(&self) -> String {
        match self {
            CompileError::Rejected { diagnostics } => diagnostics.clone(),
            other => other.to_string(),
        }
    }
}

/// A linked program and the workspace that holds it.
///
/// Dropping the artifact removes the workspace.
#[derive(Debug)]
pub struct CompiledArtifact {
    workspace: Workspace,
    binary: PathBuf,
    warnings: String,
}

impl CompiledArtifact {
    pub fn binary_path(&self) -> &Path {
        &self.binary
    }

    pub fn workspace_dir(&self) -> &Path {
        self.workspace.path()
    }

    /// Compiler warnings from a successful build, possibly empty
    pub fn warnings(&self) -> &str {
        &self.warnings
    }

    /// Remove the workspace now.
    pub fn dispose(self) -> std::io::Result<()> {
        self.workspace.close()
    }
}

/// Compiler invoker
#[derive(Debug, Clone)]
pub struct Compiler {
    config: CompilerConfig,
    workspace_root: PathBuf,
    policy: SandboxPolicy,
}

impl Compiler {
    pub fn new(
        config: CompilerConfig,
        workspace_root: impl Into<PathBuf>,
        policy: SandboxPolicy,
    ) -> Self {
        Self {
            config,
            workspace_root: workspace_root.into(),
            policy,
        }
    }

    /// Build the submission against the exercise harness in a fresh workspace.
    pub async fn compile(
        &self,
        attempt: SubmissionId,
        source: &str,
        exercise: &Exercise,
        cancel: &CancelSignal,
    ) -> Result<CompiledArtifact, CompileError> {
        if !exercise.signature.is_referenced_in(source) {
            return Err(CompileError::Rejected {
                diagnostics: format!(
                    "{SUBMISSION_FILE}: error: expected a definition of `{}`",
                    exercise.signature
                ),
            });
        }

        if let Some(directive) = forbidden_include(source) {
            return Err(CompileError::Rejected {
                diagnostics: format!(
                    "{SUBMISSION_FILE}: error: `{directive}` is not allowed; only headers named by a relative path may be included"
                ),
            });
        }

        let workspace = Workspace::create(&self.workspace_root, attempt)
            .map_err(|e| CompileError::Internal(format!("cannot create workspace: {e}")))?;

        workspace
            .write_file(SUBMISSION_FILE, &submission_unit(&exercise.signature, source))
            .await
            .map_err(|e| CompileError::Internal(format!("cannot write submission: {e}")))?;
        workspace
            .write_file(HARNESS_FILE, &exercise.test_source)
            .await
            .map_err(|e| CompileError::Internal(format!("cannot write harness: {e}")))?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.flags)
            .arg(SUBMISSION_FILE)
            .arg(HARNESS_FILE)
            .args(&self.config.linker_flags)
            .arg("-o")
            .arg(BINARY_NAME)
            .current_dir(workspace.path())
            .env("TMPDIR", workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let plan = self
            .policy
            .prepare_compile(workspace.path(), self.config.timeout_secs)
            .map_err(|e| CompileError::Internal(format!("cannot prepare sandbox: {e}")))?;
        // SAFETY: `enter` only performs async-signal-safe system calls on
        // data prepared before the fork.
        unsafe {
            command.pre_exec(move || plan.enter());
        }

        debug!(
            submission_id = %attempt,
            exercise_id = %exercise.id,
            workspace = %workspace.path().display(),
            "Compiling submission"
        );

        let child = command.spawn().map_err(|e| {
            CompileError::Internal(format!("failed to start {}: {e}", self.config.program))
        })?;
        let _group = ProcessGroupGuard::new(child.id());

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| CompileError::Internal(format!("compiler wait failed: {e}")))?
            }
            _ = tokio::time::sleep(Duration::from_secs(self.config.timeout_secs)) => {
                warn!(submission_id = %attempt, timeout_secs = self.config.timeout_secs, "Compilation timed out");
                return Err(CompileError::TimedOut);
            }
            _ = cancel.cancelled() => return Err(CompileError::Cancelled),
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let combined = if stdout.trim().is_empty() {
            stderr.into_owned()
        } else {
            format!("{stdout}{stderr}")
        };
        let diagnostics = text::truncate(
            &text::scrub_path(&combined, workspace.path(), "."),
            self.config.diagnostics_limit_bytes,
        );

        if !output.status.success() {
            debug!(submission_id = %attempt, status = %output.status, "Compilation rejected");
            let diagnostics = if diagnostics.trim().is_empty() {
                format!("compiler exited with {}", output.status)
            } else {
                diagnostics
            };
            return Err(CompileError::Rejected { diagnostics });
        }

        let binary = workspace.path().join(BINARY_NAME);
        if !binary.is_file() {
            return Err(CompileError::Internal(
                "compiler reported success but produced no program".to_string(),
            ));
        }

        Ok(CompiledArtifact {
            workspace,
            binary,
            warnings: diagnostics,
        })
    }
}

/// The learner's code preceded by the expected forward declaration.
///
/// `#line` keeps diagnostics pointing at the learner's own line numbers.
pub fn submission_unit(signature: &FunctionSignature, source: &str) -> String {
    format!(
        "{}\n#line 1 \"{SUBMISSION_FILE}\"\n{source}\n",
        signature.declaration()
    )
}

/// The first include-like directive that names a file outside the
/// compiler's search paths: absolute, climbing with `..`, or computed
/// from a macro.
pub fn forbidden_include(source: &str) -> Option<String> {
    let text = strip_comments(&splice_lines(source));
    text.lines().find_map(|line| {
        let rest = line.trim_start();
        let rest = rest
            .strip_prefix('#')
            .or_else(|| rest.strip_prefix("%:"))?
            .trim_start();
        let name_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let (name, operand) = rest.split_at(name_len);
        if !matches!(name, "include" | "include_next" | "import" | "embed") {
            return None;
        }

        let operand = operand.trim();
        let path = match operand.chars().next() {
            Some('"') => operand[1..].split('"').next(),
            Some('<') => operand[1..].split('>').next(),
            _ => None,
        };
        match path {
            Some(path) if !path.starts_with('/') && !path.split('/').any(|part| part == "..") => {
                None
            }
            _ => Some(format!("#{name} {operand}")),
        }
    })
}

/// Join physical lines ending in a backslash, as translation phase 2 does.
fn splice_lines(source: &str) -> String {
    source
        .replace("\\\r\n", "")
        .replace("\\\n", "")
        .replace("??/\n", "")
}

/// Replace comments with a space, leaving string and character literals alone.
fn strip_comments(source: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Line,
        Block,
        Literal(char),
    }

    let mut out = String::with_capacity(source.len());
    let mut state = State::Code;
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match state {
            State::Code => match (c, chars.peek()) {
                ('/', Some('/')) => {
                    chars.next();
                    state = State::Line;
                }
                ('/', Some('*')) => {
                    chars.next();
                    out.push(' ');
                    state = State::Block;
                }
                ('"' | '\'', _) => {
                    out.push(c);
                    state = State::Literal(c);
                }
                _ => out.push(c),
            },
            State::Line => {
                if c == '\n' {
                    out.push(c);
                    state = State::Code;
                }
            }
            State::Block => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                } else if c == '\n' {
                    out.push(c);
                }
            }
            State::Literal(quote) => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == quote || c == '\n' {
                    state = State::Code;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_unit_prepends_declaration() {
        let signature: FunctionSignature = "int multiplyByTwo(int x)".parse().unwrap();
        let unit = submission_unit(&signature, "int multiplyByTwo(int x) { return x * 2; }");
        let mut lines = unit.lines();
        assert_eq!(lines.next(), Some("int multiplyByTwo(int x);"));
        assert_eq!(lines.next(), Some("#line 1 \"submission.c\""));
        assert_eq!(lines.next(), Some("int multiplyByTwo(int x) { return x * 2; }"));
    }

    #[test]
    fn test_includes_outside_search_paths_are_forbidden() {
        let allowed = [
            "#include <stdio.h>\nint f(void) { return 0; }",
            "#include \"local.h\"",
            "  #  include <sys/types.h>",
            "const char *s = \"#include </etc/passwd>\";",
            "// #include \"/etc/passwd\"",
            "/* #include \"/etc/passwd\" */ int x;",
        ];
        for source in allowed {
            assert_eq!(forbidden_include(source), None, "{source}");
        }

        let forbidden = [
            "#include \"/etc/passwd\"\nint multiplyByTwo(int x) { return x * 2; }",
            "#include </etc/passwd>",
            "#include <../../../etc/passwd>",
            "#include \"sub/../../secret\"",
            "#define P \"/etc/passwd\"\n#include P",
            "#/**/include \"/etc/passwd\"",
            "%:include \"/etc/passwd\"",
            "#inc\\\nlude \"/etc/passwd\"",
            "#embed \"/etc/shadow\"",
            "#include_next </etc/hosts>",
        ];
        for source in forbidden {
            assert!(forbidden_include(source).is_some(), "{source}");
        }
    }

    #[test]
    fn test_error_classification() {
        assert!(CompileError::TimedOut.is_submission_fault());
        assert!(
            CompileError::Rejected {
                diagnostics: String::new()
            }
            .is_submission_fault()
        );
        assert!(!CompileError::Cancelled.is_submission_fault());
        assert!(!CompileError::Internal("gcc missing".into()).is_submission_fault());
        assert_eq!(CompileError::TimedOut.diagnostics(), "Compilation timed out");
    }
}
