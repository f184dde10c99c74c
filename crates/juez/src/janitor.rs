//! Sweeps workspaces left behind by crashed or killed judge processes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use walkdir::WalkDir;

use crate::workspace::WORKSPACE_PREFIX;

/// Statistics from a cleanup run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    pub dirs_scanned: u64,
    pub dirs_deleted: u64,
    pub bytes_freed: u64,
    pub errors: u64,
}

/// Removes abandoned workspaces under the workspace root
#[derive(Debug, Clone)]
pub struct Janitor {
    workspace_root: PathBuf,
    stale_after: Duration,
}

impl Janitor {
    pub fn new(workspace_root: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            stale_after,
        }
    }

    /// Delete workspace directories not modified for longer than the threshold
    pub async fn sweep(&self) -> CleanupStats {
        let mut stats = CleanupStats::default();
        let root = &self.workspace_root;

        if !root.exists() {
            tracing::debug!("Workspace root does not exist, skipping");
            return stats;
        }

        for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Error reading directory entry: {}", e);
                    stats.errors += 1;
                    continue;
                }
            };

            let is_workspace = entry.file_type().is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(WORKSPACE_PREFIX));
            if !is_workspace {
                continue;
            }

            stats.dirs_scanned += 1;
            if !self.is_stale(entry.path()).await {
                continue;
            }

            match delete_directory(entry.path()).await {
                Ok(bytes) => {
                    stats.dirs_deleted += 1;
                    stats.bytes_freed += bytes;
                    tracing::info!("Deleted stale workspace: {:?}", entry.path());
                }
                Err(e) => {
                    tracing::error!("Failed to delete {:?}: {}", entry.path(), e);
                    stats.errors += 1;
                }
            }
        }

        tracing::info!(
            scanned = stats.dirs_scanned,
            deleted = stats.dirs_deleted,
            bytes_freed = stats.bytes_freed,
            errors = stats.errors,
            "Workspace sweep complete"
        );

        stats
    }

    async fn is_stale(&self, path: &Path) -> bool {
        let Ok(modified) = fs::metadata(path).await.and_then(|m| m.modified()) else {
            return false;
        };
        modified
            .elapsed()
            .is_ok_and(|age| age >= self.stale_after)
    }

    /// Run [`sweep`](Self::sweep) on a cron schedule.
    ///
    /// The returned scheduler must be kept alive and shut down on exit.
    pub async fn schedule(self: Arc<Self>, cron_expr: &str) -> Result<JobScheduler> {
        let scheduler = JobScheduler::new().await?;
        tracing::info!("Adding workspace sweep job: {}", cron_expr);

        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let janitor = self.clone();
            Box::pin(async move {
                janitor.sweep().await;
            })
        })?;

        scheduler.add(job).await?;
        scheduler.start().await?;
        Ok(scheduler)
    }
}

/// Delete a directory recursively and return bytes freed
async fn delete_directory(path: &Path) -> std::io::Result<u64> {
    let bytes = dir_size(path);
    fs::remove_dir_all(path).await?;
    Ok(bytes)
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sweep_removes_only_stale_workspaces() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join("juez-old");
        std::fs::create_dir(&stale).unwrap();
        std::fs::write(stale.join("program"), vec![0u8; 128]).unwrap();
        let unrelated = root.path().join("keep-me");
        std::fs::create_dir(&unrelated).unwrap();
        std::fs::write(root.path().join("juez-file"), b"not a dir").unwrap();

        let stats = Janitor::new(root.path(), Duration::ZERO).sweep().await;
        assert_eq!(stats.dirs_scanned, 1);
        assert_eq!(stats.dirs_deleted, 1);
        assert_eq!(stats.bytes_freed, 128);
        assert!(!stale.exists());
        assert!(unrelated.exists());
        assert!(root.path().join("juez-file").exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_workspaces() {
        let root = tempfile::tempdir().unwrap();
        let fresh = root.path().join("juez-fresh");
        std::fs::create_dir(&fresh).unwrap();

        let stats = Janitor::new(root.path(), Duration::from_secs(3600))
            .sweep()
            .await;
        assert_eq!(stats.dirs_scanned, 1);
        assert_eq!(stats.dirs_deleted, 0);
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_missing_root_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        let stats = Janitor::new(root.path().join("absent"), Duration::ZERO)
            .sweep()
            .await;
        assert_eq!(stats, CleanupStats::default());
    }
}
