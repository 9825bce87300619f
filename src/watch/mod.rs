//! Change detection on the monitored directory.
//!
//! Wraps the platform watcher (`notify`) and turns its raw events into
//! debounced [`ChangeEvent`]s: directory-only events are dropped, hidden
//! and temporary files are filtered, and repeat events for the same path
//! inside the debounce window are suppressed. Rename events always pass
//! through and carry both the old and the new absolute path.

use crate::protocol::{ChangeEvent, EventKind};
use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind as RawKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Repeat events for the same path inside this window are suppressed.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// When the debounce table grows past this many entries, stale entries
/// are swept out so the table stays bounded for the life of the watch.
const DEBOUNCE_CAPACITY: usize = 1024;

/// Last-forwarded timestamps per path. Single writer: only the classifier
/// task touches it, so no locking is needed.
struct Debounce {
    table: HashMap<PathBuf, Instant>,
    window: Duration,
    capacity: usize,
}

impl Debounce {
    fn new(window: Duration, capacity: usize) -> Self {
        Self {
            table: HashMap::new(),
            window,
            capacity,
        }
    }

    /// Returns true if the event for `path` should be forwarded. Updates
    /// the timestamp table only on admission.
    fn admit(&mut self, path: &Path, now: Instant) -> bool {
        if let Some(&last) = self.table.get(path) {
            if now.duration_since(last) < self.window {
                return false;
            }
        }
        self.table.insert(path.to_path_buf(), now);

        if self.table.len() > self.capacity {
            let window = self.window;
            self.table
                .retain(|_, &mut last| now.duration_since(last) < window);
        }
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.len()
    }
}

/// Hidden files and editor/temp droppings never produce events.
fn is_ignored(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.starts_with('.') || name.ends_with(".tmp"),
        None => true,
    }
}

/// Map a raw watcher event onto at most one [`ChangeEvent`].
/// Directory-only events yield `None`.
fn classify(event: Event) -> Option<ChangeEvent> {
    let mut paths = event.paths.into_iter();
    match event.kind {
        RawKind::Create(CreateKind::Folder) => None,
        RawKind::Create(_) => {
            let path = paths.next()?;
            (!path.is_dir()).then(|| ChangeEvent::created(path))
        }
        RawKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let old = paths.next()?;
            let new = paths.next()?;
            Some(ChangeEvent::renamed(old, new))
        }
        // A lone "renamed from" means the path left the tree; a lone
        // "renamed to" means it appeared. Pair them up as delete/create.
        RawKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            Some(ChangeEvent::deleted(paths.next()?))
        }
        RawKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            let path = paths.next()?;
            (!path.is_dir()).then(|| ChangeEvent::created(path))
        }
        RawKind::Modify(_) => {
            let path = paths.next()?;
            (!path.is_dir()).then(|| ChangeEvent::modified(path))
        }
        RawKind::Remove(RemoveKind::Folder) => None,
        RawKind::Remove(_) => Some(ChangeEvent::deleted(paths.next()?)),
        RawKind::Access(_) | RawKind::Any | RawKind::Other => None,
    }
}

struct Running {
    // Held only to keep the platform watch registered; dropping it closes
    // the raw channel and lets the classifier drain and exit.
    _watcher: RecommendedWatcher,
    classifier: JoinHandle<()>,
}

/// Watches one directory tree recursively and emits debounced change
/// events on the channel supplied at construction.
pub struct ChangeDetector {
    dir: PathBuf,
    events: mpsc::UnboundedSender<ChangeEvent>,
    running: Option<Running>,
}

impl ChangeDetector {
    pub fn new(dir: impl Into<PathBuf>, events: mpsc::UnboundedSender<ChangeEvent>) -> Self {
        Self {
            dir: dir.into(),
            events,
            running: None,
        }
    }

    /// Register the recursive watch and start classifying. Calling start
    /// on an already-started detector is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })
        .context("failed to create filesystem watcher")?;

        watcher
            .watch(&self.dir, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", self.dir.display()))?;

        let events = self.events.clone();
        let classifier = tokio::spawn(async move {
            let mut debounce = Debounce::new(DEBOUNCE_WINDOW, DEBOUNCE_CAPACITY);

            while let Some(res) = raw_rx.recv().await {
                let raw = match res {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("watch error: {e}");
                        continue;
                    }
                };

                let Some(change) = classify(raw) else { continue };
                if is_ignored(&change.path) {
                    continue;
                }
                // Renames bypass the debounce so a move is never lost.
                if change.kind != EventKind::Rename
                    && !debounce.admit(&change.path, Instant::now())
                {
                    continue;
                }

                debug!(kind = change.kind.as_str(), path = %change.path.display(), "change detected");
                if events.send(change).is_err() {
                    break;
                }
            }
        });

        info!("watching {}", self.dir.display());
        self.running = Some(Running {
            _watcher: watcher,
            classifier,
        });
        Ok(())
    }

    /// Deregister the watch and wait for in-flight delivery to finish.
    /// Stopping a detector that is not running is a no-op.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        drop(running._watcher);
        if let Err(e) = running.classifier.await {
            warn!("classifier task failed: {e}");
        }
        info!("watch on {} stopped", self.dir.display());
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::DataChange;

    fn raw(kind: RawKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn debounce_suppresses_repeats_within_window() {
        let mut debounce = Debounce::new(Duration::from_millis(500), 16);
        let t0 = Instant::now();
        let path = Path::new("/src/a.txt");

        assert!(debounce.admit(path, t0));
        assert!(!debounce.admit(path, t0 + Duration::from_millis(100)));
        assert!(!debounce.admit(path, t0 + Duration::from_millis(499)));
        assert!(debounce.admit(path, t0 + Duration::from_millis(500)));
    }

    #[test]
    fn debounce_tracks_paths_independently() {
        let mut debounce = Debounce::new(Duration::from_millis(500), 16);
        let t0 = Instant::now();

        assert!(debounce.admit(Path::new("/src/a.txt"), t0));
        assert!(debounce.admit(Path::new("/src/b.txt"), t0));
    }

    #[test]
    fn debounce_table_stays_bounded() {
        let mut debounce = Debounce::new(Duration::from_millis(500), 8);
        let t0 = Instant::now();

        // Make the first batch stale, then overflow with fresh paths.
        for i in 0..8 {
            debounce.admit(Path::new(&format!("/old/{i}")), t0);
        }
        let later = t0 + Duration::from_secs(10);
        for i in 0..8 {
            debounce.admit(Path::new(&format!("/new/{i}")), later);
        }

        assert!(debounce.len() <= 9, "stale entries were not swept");
    }

    #[test]
    fn ignores_hidden_and_temp_files() {
        assert!(is_ignored(Path::new("/src/.hidden")));
        assert!(is_ignored(Path::new("/src/partial.tmp")));
        assert!(!is_ignored(Path::new("/src/normal.txt")));
        assert!(!is_ignored(Path::new("/src/.config/visible.txt")));
    }

    #[test]
    fn classifies_create_modify_remove() {
        let e = classify(raw(RawKind::Create(CreateKind::File), &["/src/a.txt"])).unwrap();
        assert_eq!(e.kind, EventKind::Create);

        let e = classify(raw(
            RawKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/src/a.txt"],
        ))
        .unwrap();
        assert_eq!(e.kind, EventKind::Modify);

        let e = classify(raw(RawKind::Remove(RemoveKind::File), &["/src/a.txt"])).unwrap();
        assert_eq!(e.kind, EventKind::Delete);
    }

    #[test]
    fn drops_directory_only_events() {
        assert!(classify(raw(RawKind::Create(CreateKind::Folder), &["/src/d"])).is_none());
        assert!(classify(raw(RawKind::Remove(RemoveKind::Folder), &["/src/d"])).is_none());
    }

    #[test]
    fn classifies_rename_with_both_paths() {
        let e = classify(raw(
            RawKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/src/old.txt", "/src/new.txt"],
        ))
        .unwrap();
        assert_eq!(e.kind, EventKind::Rename);
        assert_eq!(e.path, PathBuf::from("/src/old.txt"));
        assert_eq!(e.new_path, Some(PathBuf::from("/src/new.txt")));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut detector = ChangeDetector::new(tmp.path(), tx);

        detector.start().unwrap();
        detector.start().unwrap();
        assert!(detector.is_running());

        detector.stop().await;
        detector.stop().await;
        assert!(!detector.is_running());
    }
}
