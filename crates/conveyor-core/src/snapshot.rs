//! Repository snapshot accessors.
//!
//! A snapshot is how a run gets the source tree for its triggering event.
//! It is materialised once into the run's fresh workspace before any step.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[async_trait]
pub trait RepositorySnapshot: Send + Sync {
    /// Short human-readable description for logs.
    fn describe(&self) -> String;

    /// Write the snapshot's files into `dest`, which already exists and is empty.
    async fn materialize(&self, dest: &Path) -> Result<()>;
}

/// A snapshot with no files.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySnapshot;

#[async_trait]
impl RepositorySnapshot for EmptySnapshot {
    fn describe(&self) -> String {
        "empty".to_string()
    }

    async fn materialize(&self, _dest: &Path) -> Result<()> {
        Ok(())
    }
}

/// A checked-out directory on the local filesystem, copied into the workspace.
/// The `.git` directory is not copied.
#[derive(Debug, Clone)]
pub struct LocalDirSnapshot {
    root: PathBuf,
}

impl LocalDirSnapshot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RepositorySnapshot for LocalDirSnapshot {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn materialize(&self, dest: &Path) -> Result<()> {
        let meta = tokio::fs::metadata(&self.root).await.map_err(|e| {
            Error::Workspace(format!("snapshot {}: {}", self.root.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(Error::Workspace(format!(
                "snapshot {} is not a directory",
                self.root.display()
            )));
        }
        copy_tree(&self.root, dest).await
    }
}

/// Recursively copy the contents of `src` into `dest`.
///
/// Symlinks are recreated as symlinks with the same target, so links to
/// directories and dangling links copy as-is. Sockets and FIFOs are skipped.
pub async fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    let mut pending = vec![(src.to_path_buf(), dest.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name == ".git" {
                continue;
            }
            let file_type = entry.file_type().await?;
            let target = to.join(&name);
            if file_type.is_dir() {
                pending.push((entry.path(), target));
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), &target).await?;
            } else if file_type.is_symlink() {
                let link = tokio::fs::read_link(entry.path()).await?;
                tokio::fs::symlink(&link, &target).await?;
            }
        }
    }

    Ok(())
}
