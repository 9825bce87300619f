//! Bulk reconciliation passes over the whole monitored tree.
//!
//! Both modes run copies on a bounded worker pool: submission waits on a
//! semaphore permit (at most `max_workers` copies, and therefore handle
//! pairs, in flight) and completions are consumed in arrival order, not
//! submission order. The pool lives only for the duration of one pass.

use super::{SyncEngine, SyncStats};
use anyhow::Result;
use filetime::FileTime;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Enumerate every file under `root`, recursively. Unreadable entries are
/// logged and skipped rather than aborting the scan.
fn enumerate_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(entry.into_path()),
            Ok(_) => None,
            Err(e) => {
                warn!("scan error: {e}");
                None
            }
        })
        .collect()
}

/// Cheap unchanged-check: a file is up to date iff the target exists and
/// its modification time AND size both equal the source's. Any mismatch,
/// including a stat failure on either side, schedules a copy. Deliberately
/// not content-hash based.
async fn needs_sync(engine: &SyncEngine, source: &Path) -> bool {
    let target = engine.map_target(source);

    let source_meta = match fs::metadata(source).await {
        Ok(meta) => meta,
        Err(_) => return true,
    };
    let target_meta = match fs::metadata(&target).await {
        Ok(meta) => meta,
        Err(_) => return true,
    };

    let source_mtime = FileTime::from_last_modification_time(&source_meta);
    let target_mtime = FileTime::from_last_modification_time(&target_meta);

    source_mtime != target_mtime || source_meta.len() != target_meta.len()
}

/// Copy every enumerated file to the mirror.
pub async fn full_sync(engine: Arc<SyncEngine>, max_workers: usize) -> Result<SyncStats> {
    let mut stats = SyncStats::start();

    let root = engine.source_root().to_path_buf();
    info!("full sync from {}", root.display());
    let files = tokio::task::spawn_blocking(move || enumerate_files(&root)).await?;
    stats.total_files = files.len() as u64;
    info!("found {} files to sync", files.len());

    run_pool(files, max_workers, &mut stats, copy_job(&engine)).await?;

    stats.finish();
    info!(
        "full sync done in {:.2?}: {} synced, {} failed",
        stats.elapsed(),
        stats.synced_files,
        stats.failed_files
    );
    Ok(stats)
}

/// Copy only the files whose mapped target is missing or differs in
/// mtime or size; unchanged files are counted as skipped without I/O.
pub async fn incremental_sync(engine: Arc<SyncEngine>, max_workers: usize) -> Result<SyncStats> {
    let mut stats = SyncStats::start();

    let root = engine.source_root().to_path_buf();
    info!("incremental sync from {}", root.display());
    let files = tokio::task::spawn_blocking(move || enumerate_files(&root)).await?;
    stats.total_files = files.len() as u64;

    let mut to_sync = Vec::new();
    for file in files {
        if needs_sync(&engine, &file).await {
            to_sync.push(file);
        } else {
            stats.skipped_files += 1;
        }
    }
    info!("{} files need synchronization", to_sync.len());

    run_pool(to_sync, max_workers, &mut stats, copy_job(&engine)).await?;

    stats.finish();
    info!(
        "incremental sync done in {:.2?}: {} synced, {} failed, {} skipped",
        stats.elapsed(),
        stats.synced_files,
        stats.failed_files,
        stats.skipped_files
    );
    Ok(stats)
}

/// The pool job both passes submit: copy one file to the mirror.
fn copy_job(
    engine: &Arc<SyncEngine>,
) -> impl Fn(PathBuf) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>> {
    let engine = engine.clone();
    move |file| {
        let engine = engine.clone();
        Box::pin(async move { engine.copy_file(&file).await })
    }
}

/// Drive the bounded pool: a permit gates each submission of `job`, and
/// completions are folded into the stats as they arrive. Per-file errors
/// are counted and logged at the task boundary and never abort the
/// remainder of the pass.
async fn run_pool<F, Fut>(
    files: Vec<PathBuf>,
    max_workers: usize,
    stats: &mut SyncStats,
    job: F,
) -> Result<()>
where
    F: Fn(PathBuf) -> Fut,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut tasks = JoinSet::new();

    for file in files {
        let permit = semaphore.clone().acquire_owned().await?;
        let work = job(file.clone());
        tasks.spawn(async move {
            let result = work.await;
            drop(permit);
            (file, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => stats.synced_files += 1,
            Ok((file, Err(e))) => {
                stats.failed_files += 1;
                warn!("failed to sync {}: {e:#}", file.display());
            }
            Err(e) => {
                stats.failed_files += 1;
                warn!("copy task panicked: {e}");
            }
        }
    }
    Ok(())
}
