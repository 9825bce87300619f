//! Whole-pipeline test: watch -> broadcast -> receive -> apply.

use dsync::net::{Broadcaster, EventReceiver};
use dsync::sync::SyncEngine;
use dsync::watch::ChangeDetector;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(10);

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    timeout(WAIT, async {
        loop {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn change_in_watched_tree_reaches_the_mirror() {
    let tmp = TempDir::new().unwrap();
    // The watcher reports canonical paths; map from the canonical root.
    let root = tmp.path().canonicalize().unwrap();
    let src = root.join("src");
    let dst = root.join("dst");
    fs::create_dir_all(&src).unwrap();
    fs::create_dir_all(&dst).unwrap();

    // Server side: detector events forwarded to the broadcaster.
    let mut broadcaster = Broadcaster::new();
    broadcaster.start("127.0.0.1:0").await.unwrap();
    let addr = broadcaster.local_addr().unwrap();

    let (watch_tx, mut watch_rx) = mpsc::unbounded_channel();
    let mut detector = ChangeDetector::new(&src, watch_tx);
    detector.start().unwrap();

    // Client side: receiver feeding the engine.
    let (recv_tx, mut recv_rx) = mpsc::unbounded_channel();
    let mut receiver = EventReceiver::new(addr.to_string());
    receiver.start(recv_tx);

    let engine = Arc::new(SyncEngine::new(&src, &dst));
    let apply_engine = engine.clone();
    let apply_task = tokio::spawn(async move {
        while let Some(event) = recv_rx.recv().await {
            let _ = apply_engine.apply_event(&event).await;
        }
    });

    // Wait for the client to register before generating changes.
    assert!(
        timeout(WAIT, async {
            while broadcaster.client_count().await == 0 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    );

    let forward = tokio::spawn({
        let broadcaster_registry = broadcaster;
        async move {
            while let Some(event) = watch_rx.recv().await {
                broadcaster_registry.broadcast(&event).await;
            }
            broadcaster_registry
        }
    });

    fs::write(src.join("hello.txt"), "end to end").unwrap();
    // The create notification can fire before the write lands, and the
    // follow-up modify falls inside the debounce window. Touch the file
    // again after the window so a full-content event goes out.
    sleep(Duration::from_millis(700)).await;
    fs::write(src.join("hello.txt"), "end to end").unwrap();

    let mirrored = dst.join("hello.txt");
    assert!(
        wait_until(|| mirrored.exists() && file_says(&mirrored, "end to end")).await,
        "change never reached the mirror"
    );

    detector.stop().await;
    // Dropping the detector releases its event sender so the forward task
    // drains and hands the broadcaster back.
    drop(detector);
    let mut broadcaster = forward.await.unwrap();
    receiver.stop().await;
    broadcaster.stop().await;
    apply_task.abort();
}

fn file_says(path: &Path, expected: &str) -> bool {
    fs::read_to_string(path).map(|s| s == expected).unwrap_or(false)
}
