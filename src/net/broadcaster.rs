//! Server-side connection registry and message fan-out.
//!
//! Accepts inbound connections, keeps one [`ConnectionRecord`] per peer in a
//! mutex-guarded registry, and pushes every change event as one wire line to
//! all registered peers. A dedicated reader task per connection exists only
//! to notice peer disconnection; clients are not expected to send anything.

use crate::protocol::ChangeEvent;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound on one per-connection broadcast write. A peer that stops reading
/// eventually fills its socket buffers; once a write exceeds this bound
/// the connection counts as failed and is evicted, so one stalled client
/// cannot wedge fan-out to everyone else.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// One connected peer. Owned exclusively by the registry; created on accept,
/// destroyed on disconnect or send failure. `cancel` is a child token that
/// tears down this connection's reader task on eviction.
struct ConnectionRecord {
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    cancel: CancellationToken,
}

type Registry = Arc<Mutex<HashMap<u64, ConnectionRecord>>>;

/// Notification fan-out server.
pub struct Broadcaster {
    registry: Registry,
    next_id: Arc<AtomicU64>,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            accept_task: None,
            local_addr: None,
        }
    }

    /// Bind the listening address and start accepting. A bind failure is
    /// fatal; accept errors after that are logged and the loop continues.
    pub async fn start(&mut self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        let local_addr = listener.local_addr()?;
        info!("notification server listening on {local_addr}");

        let registry = self.registry.clone();
        let next_id = self.next_id.clone();
        let cancel = self.cancel.clone();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let id = next_id.fetch_add(1, Ordering::Relaxed);
                            let (read_half, write_half) = stream.into_split();
                            let conn_cancel = cancel.child_token();
                            registry.lock().await.insert(
                                id,
                                ConnectionRecord {
                                    peer,
                                    writer: write_half,
                                    cancel: conn_cancel.clone(),
                                },
                            );
                            info!("client connected: {peer}");
                            tokio::spawn(watch_peer(
                                id,
                                read_half,
                                registry.clone(),
                                conn_cancel,
                            ));
                        }
                        Err(e) => {
                            warn!("accept error: {e}");
                        }
                    },
                }
            }
        }));

        self.local_addr = Some(local_addr);
        Ok(())
    }

    /// The bound address, available after [`start`](Self::start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Serialize the event and write it to every registered connection.
    /// A write that errors or exceeds [`SEND_TIMEOUT`] marks the connection
    /// dead; dead connections are collected during the pass and evicted
    /// afterwards, never while iterating.
    pub async fn broadcast(&self, event: &ChangeEvent) -> usize {
        let mut line = event.encode_line();
        line.push('\n');

        let mut registry = self.registry.lock().await;
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, conn) in registry.iter_mut() {
            match timeout(SEND_TIMEOUT, conn.writer.write_all(line.as_bytes())).await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!("broadcast to {} failed: {e}", conn.peer);
                    dead.push(*id);
                }
                Err(_) => {
                    warn!("broadcast to {} timed out", conn.peer);
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            if let Some(conn) = registry.remove(&id) {
                conn.cancel.cancel();
                debug!("evicted {}", conn.peer);
            }
        }
        delivered
    }

    /// Number of currently registered connections.
    pub async fn client_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Stop accepting, drop every connection, and join the accept loop.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("accept loop failed: {e}");
            }
        }
        self.registry.lock().await.clear();
        info!("notification server stopped");
    }
}

/// Per-connection reader. No inbound application messages are expected;
/// its sole job is to detect EOF or a read error and unregister the peer.
async fn watch_peer(id: u64, mut reader: OwnedReadHalf, registry: Registry, cancel: CancellationToken) {
    let mut scratch = [0u8; 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {} // discard
            },
        }
    }

    if let Some(conn) = registry.lock().await.remove(&id) {
        info!("client disconnected: {}", conn.peer);
    }
}
