//! Per-attempt scratch directories.

use std::io;
use std::path::{Path, PathBuf};

use juez_common::SubmissionId;
use tempfile::TempDir;

/// Every workspace directory name starts with this prefix.
pub const WORKSPACE_PREFIX: &str = "juez-";

/// Exclusive scratch directory for one grading attempt.
///
/// The directory and everything in it is removed when the workspace is
/// dropped, whichever way the attempt ends.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh directory under `root`, named after the attempt.
    pub fn create(root: &Path, attempt: SubmissionId) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{WORKSPACE_PREFIX}{attempt}-"))
            .tempdir_in(root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `name` inside the workspace.
    pub async fn write_file(&self, name: &str, contents: &str) -> io::Result<PathBuf> {
        let path = self.dir.path().join(name);
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    /// Remove the directory now, reporting failures instead of ignoring them.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}
