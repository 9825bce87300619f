//! Synchronization engine: path mapping, streaming copy, event application.
//!
//! Every code path that needs a target location goes through
//! [`SyncEngine::map_target`], a pure function from source-side absolute
//! paths to mirror paths.

pub mod bulk;

pub use bulk::{full_sync, incremental_sync};

use crate::protocol::{ChangeEvent, EventKind};
use anyhow::{Context, Result};
use filetime::FileTime;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Fixed per-read/write chunk for streaming copies, regardless of file
/// size, to bound memory use.
pub const COPY_BUF_SIZE: usize = 8192;

/// Result of one bulk pass. Created at pass start, finalized at pass end,
/// and returned by value so nothing is shared between passes.
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub total_files: u64,
    pub synced_files: u64,
    pub failed_files: u64,
    pub skipped_files: u64,
    pub started_at: SystemTime,
    pub finished_at: Option<SystemTime>,
}

impl SyncStats {
    pub fn start() -> Self {
        Self {
            total_files: 0,
            synced_files: 0,
            failed_files: 0,
            skipped_files: 0,
            started_at: SystemTime::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(SystemTime::now());
    }

    /// A pass succeeds iff nothing failed.
    pub fn is_success(&self) -> bool {
        self.failed_files == 0
    }

    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .unwrap_or_else(SystemTime::now)
            .duration_since(self.started_at)
            .unwrap_or_default()
    }
}

/// One-way reconciliation from a source-side root to a local mirror root.
pub struct SyncEngine {
    source_root: PathBuf,
    target_root: PathBuf,
}

impl SyncEngine {
    pub fn new(source_root: impl Into<PathBuf>, target_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            target_root: target_root.into(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Map a source-side path to its mirror location: strip the source root
    /// prefix exactly once; a path outside the root degrades to
    /// `target_root/basename`. Pure, no side effects.
    pub fn map_target(&self, source: &Path) -> PathBuf {
        match source.strip_prefix(&self.source_root) {
            Ok(rel) => self.target_root.join(rel),
            Err(_) => match source.file_name() {
                Some(name) => self.target_root.join(name),
                None => self.target_root.clone(),
            },
        }
    }

    /// Copy one source file onto its mapped target: parent directory is
    /// created, data streams through a fixed-size buffer, and the source
    /// timestamps are propagated so later mtime/size comparisons hold.
    ///
    /// A missing source is a reported failure. A copy that fails partway
    /// leaves the partial target in place; the surrounding modes re-copy
    /// idempotently.
    pub async fn copy_file(&self, source: &Path) -> Result<()> {
        let target = self.map_target(source);

        let meta = fs::metadata(source)
            .await
            .with_context(|| format!("source file not found: {}", source.display()))?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut reader = File::open(source)
            .await
            .with_context(|| format!("failed to open {}", source.display()))?;
        let mut writer = File::create(&target)
            .await
            .with_context(|| format!("failed to create {}", target.display()))?;

        let mut buf = [0u8; COPY_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
        }
        writer.flush().await?;
        drop(writer);

        let atime = FileTime::from_last_access_time(&meta);
        let mtime = FileTime::from_last_modification_time(&meta);
        let target_for_times = target.clone();
        tokio::task::spawn_blocking(move || {
            filetime::set_file_times(&target_for_times, atime, mtime)
        })
        .await?
        .with_context(|| format!("failed to set timestamps on {}", target.display()))?;

        debug!("copied {} -> {}", source.display(), target.display());
        Ok(())
    }

    /// Remove the mapped target. Idempotent: an absent target is success.
    /// A directory target is removed recursively.
    pub async fn delete_target(&self, source: &Path) -> Result<()> {
        let target = self.map_target(source);

        let meta = match fs::metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to stat {}", target.display()))
            }
        };

        if meta.is_dir() {
            fs::remove_dir_all(&target)
                .await
                .with_context(|| format!("failed to remove directory {}", target.display()))?;
        } else {
            fs::remove_file(&target)
                .await
                .with_context(|| format!("failed to remove {}", target.display()))?;
        }
        debug!("deleted {}", target.display());
        Ok(())
    }

    /// Rename the mapped old target to the mapped new target.
    ///
    /// If the old target never materialized locally (its create was never
    /// observed), fall back to copying the new path's live source content.
    /// If the rename call itself fails, fall back to delete(old) +
    /// copy(new); failure of that fallback is the terminal failure for
    /// this operation.
    pub async fn rename_target(&self, old: &Path, new: &Path) -> Result<()> {
        let old_target = self.map_target(old);
        let new_target = self.map_target(new);

        match fs::metadata(&old_target).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "rename source {} absent locally, copying {} instead",
                    old_target.display(),
                    new.display()
                );
                return self.copy_file(new).await;
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to stat {}", old_target.display()))
            }
            Ok(_) => {}
        }

        if let Some(parent) = new_target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        match fs::rename(&old_target, &new_target).await {
            Ok(()) => {
                debug!("renamed {} -> {}", old_target.display(), new_target.display());
                Ok(())
            }
            Err(e) => {
                warn!(
                    "rename {} -> {} failed ({e}), falling back to delete + copy",
                    old_target.display(),
                    new_target.display()
                );
                self.delete_target(old).await?;
                self.copy_file(new).await
            }
        }
    }

    /// Apply one streamed change event to the mirror.
    pub async fn apply_event(&self, event: &ChangeEvent) -> Result<()> {
        match event.kind {
            EventKind::Create | EventKind::Modify => self.copy_file(&event.path).await,
            EventKind::Delete => self.delete_target(&event.path).await,
            EventKind::Rename => {
                let new = event
                    .new_path
                    .as_deref()
                    .context("rename event without destination path")?;
                self.rename_target(&event.path, new).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_target_strips_prefix_once() {
        let engine = SyncEngine::new("/src", "/dst");
        assert_eq!(
            engine.map_target(Path::new("/src/a/b.txt")),
            PathBuf::from("/dst/a/b.txt")
        );
    }

    #[test]
    fn map_target_never_leaves_leading_separator() {
        let engine = SyncEngine::new("/src/", "/dst");
        let mapped = engine.map_target(Path::new("/src/a.txt"));
        assert_eq!(mapped, PathBuf::from("/dst/a.txt"));
    }

    #[test]
    fn map_target_degrades_to_basename_outside_root() {
        let engine = SyncEngine::new("/src", "/dst");
        assert_eq!(
            engine.map_target(Path::new("/elsewhere/deep/c.txt")),
            PathBuf::from("/dst/c.txt")
        );
    }

    #[test]
    fn map_target_is_deterministic() {
        let engine = SyncEngine::new("/src", "/dst");
        let p = Path::new("/src/x/y.bin");
        assert_eq!(engine.map_target(p), engine.map_target(p));
    }

    #[test]
    fn stats_success_tracks_failures() {
        let mut stats = SyncStats::start();
        assert!(stats.is_success());
        stats.failed_files = 1;
        stats.finish();
        assert!(!stats.is_success());
        assert!(stats.finished_at.is_some());
    }
}
