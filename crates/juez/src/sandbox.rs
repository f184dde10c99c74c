//! Process isolation for untrusted programs.
//!
//! A [`SandboxPlan`] is computed in the parent and applied in the child
//! between `fork` and `exec`. Everything it needs (uid/gid map contents,
//! the mount table, rlimit values) is prepared up front so the child only
//! issues system calls.
//!
//! With a PID namespace the spawned child never execs itself. It forks the
//! real program as PID 1 of the namespace and stays behind as a supervisor
//! that mirrors the program's exit status. When PID 1 dies the kernel kills
//! every process left in the namespace, including ones that called
//! `setsid()` to leave the process group.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use juez_common::Limits;
use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use nix::sched::{CloneFlags, unshare};
use nix::sys::prctl;
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use nix::sys::signal::{SigHandler, Signal, killpg, raise, signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Pid, Uid, chdir, fork};
use tokio::process::Command;
use tracing::{info, warn};

/// Largest file the compiler may write into its workspace
const COMPILE_FILE_BYTES: u64 = 256 * 1024 * 1024;

/// Highest descriptor the supervisor closes before waiting
const MAX_INHERITED_FD: u64 = 65_536;

/// Isolation settings applied to every program run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    /// Fail the run when namespaces or limits cannot be applied
    pub strict: bool,
    /// Run in an empty network namespace
    pub isolate_network: bool,
    /// Run as PID 1 of a fresh PID namespace
    pub isolate_pids: bool,
    /// Make every mount outside the workspace read-only
    pub readonly_root: bool,
    /// `RLIMIT_NOFILE`
    pub max_open_files: u64,
    /// `RLIMIT_AS` as a multiple of the memory limit; 0 disables it
    pub address_space_factor: u64,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            strict: false,
            isolate_network: true,
            isolate_pids: true,
            readonly_root: true,
            max_open_files: 64,
            address_space_factor: 4,
        }
    }
}

impl SandboxPolicy {
    /// Compute the plan for one run in `workspace` under `limits`.
    pub fn prepare(&self, workspace: &Path, limits: &Limits) -> io::Result<SandboxPlan> {
        let cpu_secs = limits.timeout_ms.div_ceil(1000) + 1;
        let mut rlimits = vec![
            (Resource::RLIMIT_NOFILE, self.max_open_files),
            (Resource::RLIMIT_FSIZE, limits.max_output_bytes),
            (Resource::RLIMIT_CPU, cpu_secs),
        ];
        if self.address_space_factor > 0 {
            rlimits.push((
                Resource::RLIMIT_AS,
                limits.max_memory_bytes.saturating_mul(self.address_space_factor),
            ));
        }
        self.plan(workspace, rlimits)
    }

    /// Compute the plan for a compiler run in `workspace`.
    ///
    /// Same namespaces and mount view as a program run; the compiler keeps
    /// its address space and may write build outputs.
    pub fn prepare_compile(&self, workspace: &Path, timeout_secs: u64) -> io::Result<SandboxPlan> {
        let rlimits = vec![
            (Resource::RLIMIT_NOFILE, self.max_open_files.max(256)),
            (Resource::RLIMIT_FSIZE, COMPILE_FILE_BYTES),
            (Resource::RLIMIT_CPU, timeout_secs + 1),
        ];
        self.plan(workspace, rlimits)
    }

    fn plan(&self, workspace: &Path, rlimits: Vec<(Resource, u64)>) -> io::Result<SandboxPlan> {
        let mut unshare_flags = CloneFlags::empty();
        if self.isolate_network {
            unshare_flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.readonly_root {
            unshare_flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.isolate_pids {
            unshare_flags |= CloneFlags::CLONE_NEWPID;
        }
        if !unshare_flags.is_empty() {
            unshare_flags |= CloneFlags::CLONE_NEWUSER;
        }

        let readonly = if self.readonly_root {
            match fs::read_to_string("/proc/self/mountinfo") {
                Ok(table) => Some(readonly_mounts(&table, workspace)),
                Err(e) if self.strict => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Cannot read mount table, skipping read-only remount");
                    None
                }
            }
        } else {
            None
        };

        let uid = Uid::current();
        let gid = Gid::current();

        Ok(SandboxPlan {
            strict: self.strict,
            unshare_flags,
            uid_map: format!("{uid} {uid} 1\n").into_bytes(),
            gid_map: format!("{gid} {gid} 1\n").into_bytes(),
            workspace: workspace.to_path_buf(),
            readonly,
            rlimits,
        })
    }
}

/// A mount to make read-only, with the flags its remount must keep.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadonlyMount {
    path: PathBuf,
    flags: MsFlags,
}

/// Isolation steps for a single child, ready to run after `fork`.
#[derive(Debug, Clone)]
pub struct SandboxPlan {
    strict: bool,
    unshare_flags: CloneFlags,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
    workspace: PathBuf,
    readonly: Option<Vec<ReadonlyMount>>,
    rlimits: Vec<(Resource, u64)>,
}

impl SandboxPlan {
    /// Apply the plan to the calling process.
    ///
    /// Runs in the forked child: no allocation, no locks, no logging. With a
    /// PID namespace this call only returns in the program's process; the
    /// supervisor exits from inside it.
    pub fn enter(&self) -> io::Result<()> {
        self.check(prctl::set_pdeathsig(Signal::SIGKILL))?;
        self.check(setrlimit(Resource::RLIMIT_CORE, 0, 0))?;

        if !self.unshare_flags.is_empty() {
            let applied = match unshare(self.unshare_flags) {
                Ok(()) => Some(self.unshare_flags),
                Err(e) if self.strict => return Err(e.into()),
                Err(_) => {
                    let fallback = self.unshare_flags - CloneFlags::CLONE_NEWPID;
                    (fallback != self.unshare_flags && unshare(fallback).is_ok()).then_some(fallback)
                }
            };
            if let Some(flags) = applied {
                self.isolate()?;
                if flags.contains(CloneFlags::CLONE_NEWPID) {
                    self.fork_namespace_init()?;
                }
            }
        }

        for (resource, value) in &self.rlimits {
            self.check(setrlimit(*resource, *value, *value))?;
        }

        self.check(prctl::set_no_new_privs())
    }

    fn isolate(&self) -> io::Result<()> {
        self.check(write_proc_file("/proc/self/setgroups", b"deny"))?;
        self.check(write_proc_file("/proc/self/uid_map", &self.uid_map))?;
        self.check(write_proc_file("/proc/self/gid_map", &self.gid_map))?;

        let Some(readonly) = &self.readonly else {
            return Ok(());
        };

        self.check(mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        ))?;
        self.check(mount(
            Some(self.workspace.as_path()),
            self.workspace.as_path(),
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        ))?;
        // A remount never recurses, so every mount is handled on its own.
        for entry in readonly {
            let result = mount(
                None::<&str>,
                entry.path.as_path(),
                None::<&str>,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY | entry.flags,
                None::<&str>,
            );
            match result {
                // Shadowed by a later mount; nothing can reach it.
                Err(Errno::ENOENT) | Err(Errno::EINVAL) => {}
                other => self.check(other)?,
            }
        }
        // The old cwd still points below the read-only root.
        self.check(chdir(self.workspace.as_path()))
    }

    /// Fork the program as PID 1 of the new namespace.
    ///
    /// Returns in the program; the calling process becomes its supervisor.
    fn fork_namespace_init(&self) -> io::Result<()> {
        // SAFETY: only async-signal-safe calls follow in both processes.
        match unsafe { fork() }? {
            ForkResult::Child => {
                // Killing the supervisor must take the namespace down with it.
                prctl::set_pdeathsig(Signal::SIGKILL)?;
                Ok(())
            }
            ForkResult::Parent { child } => supervise(child),
        }
    }

    fn check<E: Into<io::Error>>(&self, result: Result<(), E>) -> io::Result<()> {
        match result {
            Err(e) if self.strict => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Wait for the namespace init and exit the way it did.
fn supervise(child: Pid) -> ! {
    // Pipes must reach EOF once the program side is gone, and the spawn
    // error pipe must not be held open by this process.
    let fd_limit = getrlimit(Resource::RLIMIT_NOFILE)
        .map(|(soft, _)| soft.min(MAX_INHERITED_FD))
        .unwrap_or(1024);
    for fd in 0..fd_limit as i32 {
        // SAFETY: nothing in this process uses descriptors after this point.
        unsafe {
            libc::close(fd);
        }
    }

    let code = loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                // SAFETY: resetting a disposition is async-signal-safe.
                unsafe {
                    let _ = signal(sig, SigHandler::SigDfl);
                }
                let _ = raise(sig);
                break 128 + sig as i32;
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => break 127,
        }
    };
    // SAFETY: `_exit` skips atexit handlers inherited from the parent.
    unsafe { libc::_exit(code) }
}

fn write_proc_file(path: &str, contents: &[u8]) -> io::Result<()> {
    OpenOptions::new().write(true).open(path)?.write_all(contents)
}

/// Writable mounts from a `/proc/<pid>/mountinfo` table, minus the workspace.
///
/// The last entry for a mount point wins, as it is the one on top.
fn readonly_mounts(mountinfo: &str, workspace: &Path) -> Vec<ReadonlyMount> {
    let mut mounts = BTreeMap::new();
    for line in mountinfo.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        let path = PathBuf::from(unescape_mount_path(fields[4]));
        let options: Vec<&str> = fields[5].split(',').collect();
        if options.contains(&"ro") {
            mounts.remove(&path);
        } else {
            mounts.insert(path, locked_mount_flags(&options));
        }
    }

    mounts
        .into_iter()
        .filter(|(path, _)| !path.starts_with(workspace))
        .map(|(path, flags)| ReadonlyMount { path, flags })
        .collect()
}

/// Flags an unprivileged remount must keep, from per-mount options.
fn locked_mount_flags(options: &[&str]) -> MsFlags {
    let mut flags = options
        .iter()
        .filter_map(|option| match *option {
            "nosuid" => Some(MsFlags::MS_NOSUID),
            "nodev" => Some(MsFlags::MS_NODEV),
            "noexec" => Some(MsFlags::MS_NOEXEC),
            "noatime" => Some(MsFlags::MS_NOATIME),
            "nodiratime" => Some(MsFlags::MS_NODIRATIME),
            "relatime" => Some(MsFlags::MS_RELATIME),
            _ => None,
        })
        .fold(MsFlags::empty(), |acc, flag| acc | flag);
    if !flags.intersects(MsFlags::MS_NOATIME | MsFlags::MS_RELATIME) {
        flags |= MsFlags::MS_STRICTATIME;
    }
    flags
}

/// Undo the octal escapes (`\040` and friends) of mountinfo paths.
fn unescape_mount_path(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Check whether full isolation works on this host and log the effective mode.
///
/// Returns `true` when namespaces can be created.
pub async fn probe(policy: &SandboxPolicy, scratch: &Path) -> bool {
    let strict = SandboxPolicy {
        strict: true,
        ..policy.clone()
    };
    let outcome = match strict.prepare(scratch, &Limits::default()) {
        Ok(plan) => {
            let mut command = Command::new("/bin/sh");
            command
                .arg("-c")
                .arg("exit 0")
                .current_dir(scratch)
                .env_clear()
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            // SAFETY: `enter` only performs async-signal-safe system calls on
            // data prepared before the fork.
            unsafe {
                command.pre_exec(move || plan.enter());
            }
            match command.status().await {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(io::Error::other(format!("probe exited with {status}"))),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            info!(
                isolate_network = policy.isolate_network,
                isolate_pids = policy.isolate_pids,
                readonly_root = policy.readonly_root,
                "Sandbox namespaces available"
            );
            true
        }
        Err(e) if policy.strict => {
            warn!(error = %e, "Sandbox namespaces unavailable; strict mode will fail every run");
            false
        }
        Err(e) => {
            warn!(error = %e, "Sandbox namespaces unavailable; running with resource limits only");
            false
        }
    }
}

/// SIGKILL every process in the group led by `pid`.
pub fn kill_process_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    // ESRCH just means the group is already gone.
    let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
}

/// Kills a process group when dropped.
#[derive(Debug)]
pub struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    pub fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid {
            kill_process_group(pgid);
        }
    }
}
