//! Working-tree checkpoints kept in a private git object store, outside
//! the user's own repository.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use colloquy_core::errors::SnapshotError;
use colloquy_core::ids::SessionId;
use colloquy_core::snapshot::{SnapshotCoordinator, SnapshotRef};

/// Coordinator for sessions without a working tree.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSnapshots;

#[async_trait]
impl SnapshotCoordinator for NoSnapshots {
    async fn create(&self, _session_id: &SessionId) -> Result<Option<SnapshotRef>, SnapshotError> {
        Ok(None)
    }

    async fn restore(&self, _session_id: &SessionId, snapshot: &SnapshotRef) -> Result<(), SnapshotError> {
        Err(SnapshotError::Unknown(snapshot.to_string()))
    }

    async fn diff(&self, _session_id: &SessionId, snapshot: &SnapshotRef) -> Result<String, SnapshotError> {
        Err(SnapshotError::Unknown(snapshot.to_string()))
    }
}

pub struct GitSnapshots {
    worktree: PathBuf,
    git_dir: PathBuf,
    initialized: OnceCell<()>,
}

impl GitSnapshots {
    /// Snapshots of `worktree`, stored under `data_dir/snapshot/<hash>`.
    pub fn new(data_dir: &Path, worktree: &Path) -> Self {
        let digest = Sha256::digest(worktree.to_string_lossy().as_bytes());
        let key: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        Self {
            worktree: worktree.to_path_buf(),
            git_dir: data_dir.join("snapshot").join(key),
            initialized: OnceCell::new(),
        }
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// Whether a `git` binary can be spawned.
    pub async fn available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|s| s.success())
    }

    async fn ensure_init(&self) -> Result<(), SnapshotError> {
        self.initialized
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(&self.git_dir).await?;
                let _ = self.git(&["init", "--quiet"]).await?;
                let _ = self.git(&["config", "core.autocrlf", "false"]).await?;
                debug!(git_dir = %self.git_dir.display(), "snapshot store initialized");
                Ok::<(), SnapshotError>(())
            })
            .await
            .map(|_| ())
    }

    async fn git(&self, args: &[&str]) -> Result<String, SnapshotError> {
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(&self.git_dir)
            .arg("--work-tree")
            .arg(&self.worktree)
            .args(args)
            .current_dir(&self.worktree)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(SnapshotError::Command(format!(
                "git {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SnapshotCoordinator for GitSnapshots {
    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn create(&self, session_id: &SessionId) -> Result<Option<SnapshotRef>, SnapshotError> {
        if !tokio::fs::try_exists(&self.worktree).await? {
            return Ok(None);
        }
        self.ensure_init().await?;
        let _ = self.git(&["add", "-A", "."]).await?;
        let tree = self.git(&["write-tree"]).await?;
        Ok(Some(SnapshotRef::new(tree.trim())))
    }

    #[instrument(skip_all, fields(session_id = %session_id, snapshot = %snapshot))]
    async fn restore(&self, session_id: &SessionId, snapshot: &SnapshotRef) -> Result<(), SnapshotError> {
        self.ensure_init().await?;
        let _ = self.git(&["read-tree", snapshot.as_str()]).await?;
        let _ = self.git(&["checkout-index", "-a", "-f"]).await?;
        let _ = self.git(&["clean", "-f", "-d", "-q"]).await?;
        Ok(())
    }

    async fn diff(&self, _session_id: &SessionId, snapshot: &SnapshotRef) -> Result<String, SnapshotError> {
        self.ensure_init().await?;
        let _ = self.git(&["add", "-A", "."]).await?;
        self.git(&["diff-index", "--cached", "-p", "--no-color", snapshot.as_str()])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> Option<(tempfile::TempDir, tempfile::TempDir, GitSnapshots)> {
        if !GitSnapshots::available().await {
            eprintln!("git not available, skipping");
            return None;
        }
        let data = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let snaps = GitSnapshots::new(data.path(), work.path());
        Some((data, work, snaps))
    }

    #[tokio::test]
    async fn no_snapshots_creates_nothing() {
        assert_eq!(NoSnapshots.create(&SessionId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn git_dir_lives_outside_worktree() {
        let snaps = GitSnapshots::new(Path::new("/data"), Path::new("/work/project"));
        assert!(snaps.git_dir().starts_with("/data/snapshot"));
        let again = GitSnapshots::new(Path::new("/data"), Path::new("/work/project"));
        assert_eq!(snaps.git_dir(), again.git_dir());
    }

    #[tokio::test]
    async fn diff_reports_changes() {
        let Some((_data, work, snaps)) = fixture().await else { return };
        let sid = SessionId::new();
        std::fs::write(work.path().join("a.txt"), "one\n").unwrap();
        let snap = snaps.create(&sid).await.unwrap().unwrap();

        assert_eq!(snaps.diff(&sid, &snap).await.unwrap(), "");
        std::fs::write(work.path().join("a.txt"), "two\n").unwrap();
        let patch = snaps.diff(&sid, &snap).await.unwrap();
        assert!(patch.contains("-one"));
        assert!(patch.contains("+two"));
    }

    #[tokio::test]
    async fn revert_then_restore_round_trips() {
        let Some((_data, work, snaps)) = fixture().await else { return };
        let sid = SessionId::new();
        let file = work.path().join("a.txt");
        std::fs::write(&file, "original\n").unwrap();
        let before = snaps.create(&sid).await.unwrap().unwrap();

        std::fs::write(&file, "edited\n").unwrap();
        std::fs::write(work.path().join("new.txt"), "fresh\n").unwrap();
        let edited = snaps.create(&sid).await.unwrap().unwrap();

        snaps.restore(&sid, &before).await.unwrap();
        assert_eq!(snaps.diff(&sid, &before).await.unwrap(), "");
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "original\n");
        assert!(!work.path().join("new.txt").exists());

        snaps.restore(&sid, &edited).await.unwrap();
        assert_eq!(snaps.diff(&sid, &edited).await.unwrap(), "");
        assert!(work.path().join("new.txt").exists());
    }
}
