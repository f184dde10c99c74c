//! Runs compiled submissions under time, memory and output limits.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use juez_common::{ExecutionResult, Limits};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, error, warn};

use crate::cancel::CancelSignal;
use crate::compiler::CompiledArtifact;
use crate::sandbox::{ProcessGroupGuard, SandboxPolicy, kill_process_group};

/// How often the memory watchdog samples the child
const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long to wait for output pipes after the process group is gone
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Why the wait for the child ended
enum Ending {
    Exited(ExitStatus),
    TimedOut,
    OutOfMemory,
    Cancelled,
}

/// Executes compiled artifacts inside the sandbox
#[derive(Debug, Clone)]
pub struct Executor {
    policy: SandboxPolicy,
}

impl Executor {
    pub fn new(policy: SandboxPolicy) -> Self {
        Self { policy }
    }

    /// Run the artifact once.
    ///
    /// Never fails: judge-side problems come back as a result with
    /// `internal_error` set.
    pub async fn run(
        &self,
        artifact: &CompiledArtifact,
        limits: &Limits,
        cancel: &CancelSignal,
    ) -> ExecutionResult {
        let start = Instant::now();
        match self.try_run(artifact, limits, cancel, start).await {
            Ok(result) => result,
            Err(e) => {
                error!(binary = %artifact.binary_path().display(), error = %e, "Failed to run artifact");
                ExecutionResult::internal(e.to_string(), elapsed_ms(start))
            }
        }
    }

    async fn try_run(
        &self,
        artifact: &CompiledArtifact,
        limits: &Limits,
        cancel: &CancelSignal,
        start: Instant,
    ) -> io::Result<ExecutionResult> {
        let workspace = artifact.workspace_dir();
        let plan = self.policy.prepare(workspace, limits)?;

        let mut command = Command::new(artifact.binary_path());
        command
            .current_dir(workspace)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        // SAFETY: `enter` only performs async-signal-safe system calls on
        // data prepared before the fork.
        unsafe {
            command.pre_exec(move || plan.enter());
        }

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child exited before its pid was read"))?;
        let _group = ProcessGroupGuard::new(Some(pid));

        let output_cap = usize::try_from(limits.max_output_bytes).unwrap_or(usize::MAX);
        let stdout = OutputCapture::default();
        let stderr = OutputCapture::default();
        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), output_cap, stdout.clone()));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), output_cap, stderr.clone()));

        let limit_kb = limits.max_memory_bytes / 1024;
        let mut peak_kb = 0;

        let ending = {
            let watchdog = watch_memory(pid, limit_kb, &mut peak_kb);
            tokio::select! {
                status = child.wait() => Ending::Exited(status?),
                _ = tokio::time::sleep(limits.timeout()) => Ending::TimedOut,
                _ = watchdog => Ending::OutOfMemory,
                _ = cancel.cancelled() => Ending::Cancelled,
            }
        };

        let status = match ending {
            Ending::Exited(status) => status,
            _ => {
                kill_process_group(pid);
                child.wait().await?
            }
        };
        let duration_ms = elapsed_ms(start);

        let (stdout, stdout_truncated) = join_reader(stdout_task, stdout).await;
        let (stderr, stderr_truncated) = join_reader(stderr_task, stderr).await;

        let mut result = ExecutionResult {
            exit_code: status.code(),
            signal: status.signal(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            output_truncated: stdout_truncated || stderr_truncated,
            duration_ms,
            peak_memory_kb: peak_kb,
            ..Default::default()
        };

        match ending {
            Ending::Exited(_) => {
                result.memory_limit_exceeded = peak_kb > limit_kb;
            }
            Ending::TimedOut => {
                result.exit_code = None;
                result.time_limit_exceeded = true;
            }
            Ending::OutOfMemory => {
                result.exit_code = None;
                result.memory_limit_exceeded = true;
            }
            Ending::Cancelled => {
                result.internal_error = Some("cancelled".to_string());
            }
        }

        debug!(
            pid,
            exit_code = ?result.exit_code,
            signal = ?result.signal,
            duration_ms,
            peak_memory_kb = peak_kb,
            tle = result.time_limit_exceeded,
            mle = result.memory_limit_exceeded,
            truncated = result.output_truncated,
            "Execution finished"
        );

        Ok(result)
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Bytes kept from one output stream, shared with its reader task.
#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    inner: Arc<Mutex<Captured>>,
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl OutputCapture {
    fn push(&self, chunk: &[u8], cap: usize) {
        let mut captured = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let room = cap.saturating_sub(captured.bytes.len());
        if chunk.len() > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Take what was captured so far and whether anything was discarded.
    pub fn take(&self) -> (Vec<u8>, bool) {
        let mut captured = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        (std::mem::take(&mut captured.bytes), captured.truncated)
    }
}

async fn join_reader(task: tokio::task::JoinHandle<()>, capture: OutputCapture) -> (Vec<u8>, bool) {
    let abort = task.abort_handle();
    match tokio::time::timeout(PIPE_DRAIN_GRACE, task).await {
        Ok(Ok(())) => capture.take(),
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader failed");
            capture.take()
        }
        // Something outside the sandbox still holds the pipe open.
        Err(_) => {
            abort.abort();
            let (bytes, _) = capture.take();
            (bytes, true)
        }
    }
}

/// Read everything from `reader` into `capture`, keeping at most `cap` bytes.
pub async fn read_capped<R>(reader: Option<R>, cap: usize, capture: OutputCapture)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };

    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => capture.push(&chunk[..n], cap),
        }
    }
}

/// Resolve once the program's peak resident set exceeds `limit_kb`.
///
/// `peak_kb` keeps the highest value observed so far across the program
/// and its descendants.
async fn watch_memory(pid: u32, limit_kb: u64, peak_kb: &mut u64) {
    let root = program_root(pid).await;
    loop {
        for process in process_tree(root).await {
            let path = format!("/proc/{process}/status");
            if let Ok(status) = tokio::fs::read_to_string(&path).await {
                if let Some(hwm) = parse_status_kb(&status, "VmHWM:") {
                    *peak_kb = (*peak_kb).max(hwm);
                }
            }
        }
        if *peak_kb > limit_kb {
            return;
        }
        tokio::time::sleep(MEMORY_POLL_INTERVAL).await;
    }
}

/// The process running the artifact.
///
/// Under a PID namespace `pid` is only the supervisor, whose memory is a
/// copy of the judge's; the program is its child running as PID 1.
async fn program_root(pid: u32) -> u32 {
    for child in children(pid).await {
        let Ok(status) = tokio::fs::read_to_string(format!("/proc/{child}/status")).await else {
            continue;
        };
        if is_namespace_init(&status) {
            return child;
        }
    }
    pid
}

/// `root` and all of its descendants.
async fn process_tree(root: u32) -> Vec<u32> {
    let mut tree = vec![root];
    let mut next = 0;
    while next < tree.len() {
        let grandchildren = children(tree[next]).await;
        tree.extend(grandchildren);
        next += 1;
    }
    tree
}

async fn children(pid: u32) -> Vec<u32> {
    tokio::fs::read_to_string(format!("/proc/{pid}/task/{pid}/children"))
        .await
        .map(|list| list.split_whitespace().filter_map(|p| p.parse().ok()).collect())
        .unwrap_or_default()
}

/// Whether a `/proc/<pid>/status` belongs to PID 1 of a nested namespace.
fn is_namespace_init(status: &str) -> bool {
    status
        .lines()
        .find_map(|line| line.strip_prefix("NSpid:"))
        .map(|ids| {
            let ids: Vec<&str> = ids.split_whitespace().collect();
            ids.len() > 1 && ids.last() == Some(&"1")
        })
        .unwrap_or(false)
}

/// Extract a `Key:   1234 kB` field from `/proc/<pid>/status`.
fn parse_status_kb(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_kb() {
        let status = "Name:\tprogram\nVmPeak:\t  10240 kB\nVmHWM:\t    2048 kB\nVmRSS:\t    1024 kB\n";
        assert_eq!(parse_status_kb(status, "VmHWM:"), Some(2048));
        assert_eq!(parse_status_kb(status, "VmRSS:"), Some(1024));
        assert_eq!(parse_status_kb(status, "VmSwap:"), None);
    }

    #[test]
    fn test_namespace_init_detection() {
        assert!(is_namespace_init("Name:\tprogram\nNSpid:\t4242\t1\n"));
        assert!(!is_namespace_init("Name:\tjuez\nNSpid:\t4241\n"));
        assert!(!is_namespace_init("Name:\tprogram\nNSpid:\t4243\t2\n"));
        assert!(!is_namespace_init("Name:\told-kernel\n"));
    }

    #[tokio::test]
    async fn test_read_capped_keeps_prefix_and_flags_truncation() {
        let data = vec![b'x'; 20_000];
        let capture = OutputCapture::default();
        read_capped(Some(data.as_slice()), 100, capture.clone()).await;
        let (captured, truncated) = capture.take();
        assert_eq!(captured.len(), 100);
        assert!(truncated);

        let capture = OutputCapture::default();
        read_capped(Some(&b"hello"[..]), 100, capture.clone()).await;
        assert_eq!(capture.take(), (b"hello".to_vec(), false));

        let capture = OutputCapture::default();
        read_capped(None::<&[u8]>, 100, capture.clone()).await;
        assert_eq!(capture.take(), (Vec::new(), false));
    }

    #[tokio::test]
    async fn test_read_capped_exact_fit_is_not_truncated() {
        let capture = OutputCapture::default();
        read_capped(Some(&b"12345"[..]), 5, capture.clone()).await;
        let (captured, truncated) = capture.take();
        assert_eq!(captured.len(), 5);
        assert!(!truncated);
    }

    #[tokio::test]
    async fn test_held_pipe_keeps_captured_prefix() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let capture = OutputCapture::default();
        let task = tokio::spawn(read_capped(Some(reader), 1024, capture.clone()));

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"All tests passed!\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The writer stays open, so the reader never sees EOF.
        let (bytes, truncated) = join_reader(task, capture).await;
        assert_eq!(bytes, b"All tests passed!\n");
        assert!(truncated);
        drop(writer);
    }
}
