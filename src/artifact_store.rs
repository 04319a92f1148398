use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, warn};

pub async fn ensure_work_root(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create work root at {}", path.display()))
}

pub fn scratch_dir(work_root: &Path, task_id: &str) -> PathBuf {
    work_root.join(task_id)
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

/// Temporary local assets of one pipeline run.
///
/// Every allocated path is deleted by [`ScratchSpace::release`], which
/// consumes the space so it runs at most once. Each deletion is attempted even
/// when an earlier one failed. Dropping an unreleased space falls back to a
/// synchronous best-effort removal of the whole directory.
#[derive(Debug)]
pub struct ScratchSpace {
    dir: PathBuf,
    assets: Vec<PathBuf>,
    released: bool,
}

impl ScratchSpace {
    pub async fn create(work_root: &Path, task_id: &str) -> Result<Self> {
        let dir = scratch_dir(work_root, task_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create scratch directory {}", dir.display()))?;
        Ok(Self {
            dir,
            assets: Vec::new(),
            released: false,
        })
    }

    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[cfg(test)]
    pub fn assets(&self) -> &[PathBuf] {
        &self.assets
    }

    pub fn allocate(&mut self, file_name: &str) -> PathBuf {
        let path = self.dir.join(file_name);
        if !self.assets.contains(&path) {
            self.assets.push(path.clone());
        }
        path
    }

    pub async fn release(mut self) -> usize {
        self.released = true;
        let mut failures = 0;

        for asset in &self.assets {
            if let Err(err) = delete_file_if_exists(asset).await {
                failures += 1;
                warn!(path = %asset.display(), "Failed to release scratch asset: {err:#}");
            }
        }

        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                failures += 1;
                warn!(dir = %self.dir.display(), "Failed to remove scratch directory: {err}");
            }
        }

        debug!(
            dir = %self.dir.display(),
            assets = self.assets.len(),
            failures,
            "Scratch space released"
        );
        failures
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), "Failed to remove abandoned scratch directory: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_removes_assets_and_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut scratch = ScratchSpace::create(root.path(), "task-1").await.unwrap();
        let video = scratch.allocate("video.mp4");
        let audio = scratch.allocate("audio.m4a");
        std::fs::write(&video, b"v").unwrap();
        std::fs::write(&audio, b"a").unwrap();
        let dir = scratch.dir().to_path_buf();

        assert_eq!(scratch.assets().len(), 2);
        assert_eq!(scratch.release().await, 0);
        assert!(!video.exists());
        assert!(!audio.exists());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn assets_never_written_are_not_failures() {
        let root = tempfile::tempdir().unwrap();
        let mut scratch = ScratchSpace::create(root.path(), "task-2").await.unwrap();
        scratch.allocate("video.mp4");
        assert_eq!(scratch.allocate("video.mp4"), scratch.dir().join("video.mp4"));
        assert_eq!(scratch.assets().len(), 1);
        assert_eq!(scratch.release().await, 0);
    }

    #[tokio::test]
    async fn one_failed_removal_does_not_stop_the_others() {
        let root = tempfile::tempdir().unwrap();
        let mut scratch = ScratchSpace::create(root.path(), "task-3").await.unwrap();
        // A directory where a file is expected makes remove_file fail.
        let blocked = scratch.allocate("blocked");
        std::fs::create_dir(&blocked).unwrap();
        let plain = scratch.allocate("plain.bin");
        std::fs::write(&plain, b"x").unwrap();
        let dir = scratch.dir().to_path_buf();

        assert_eq!(scratch.release().await, 1);
        assert!(!plain.exists());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn dropping_unreleased_space_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let dir = {
            let mut scratch = ScratchSpace::create(root.path(), "task-4").await.unwrap();
            std::fs::write(scratch.allocate("x"), b"x").unwrap();
            scratch.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }
}
