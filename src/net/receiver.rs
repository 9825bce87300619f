//! Client-side persistent connection to the notification server.
//!
//! Maintains one logical connection, reconnecting with a fixed backoff for
//! as long as the receiver is enabled. Incoming bytes accumulate in a
//! buffer; every complete `\n`-terminated line is decoded and handed to the
//! caller's channel in arrival order, with a partial trailing line retained
//! for the next read.

use crate::protocol::ChangeEvent;
use anyhow::{bail, Result};
use bytes::BytesMut;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fixed delay between reconnect attempts.
pub const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(3);

/// Connection lifecycle. `Stopped` is terminal and reached only through an
/// explicit [`EventReceiver::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Stopped = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Stopped,
            _ => Self::Disconnected,
        }
    }
}

/// Persistent notification receiver.
pub struct EventReceiver {
    addr: String,
    state: Arc<AtomicU8>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    cancel: CancellationToken,
    conn_task: Option<JoinHandle<()>>,
}

impl EventReceiver {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            state: Arc::new(AtomicU8::new(ConnState::Disconnected as u8)),
            writer: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            conn_task: None,
        }
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Spawn the connect/reconnect control flow. Decoded events are pushed
    /// onto `events` in exact wire arrival order.
    pub fn start(&mut self, events: mpsc::UnboundedSender<ChangeEvent>) {
        if self.conn_task.is_some() {
            return;
        }

        let addr = self.addr.clone();
        let state = self.state.clone();
        let writer_slot = self.writer.clone();
        let cancel = self.cancel.clone();

        self.conn_task = Some(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                state.store(ConnState::Connecting as u8, Ordering::Release);
                info!("connecting to {addr}...");

                let connected = tokio::select! {
                    _ = cancel.cancelled() => break,
                    conn = TcpStream::connect(&addr) => conn,
                };

                match connected {
                    Ok(stream) => {
                        let (read_half, write_half) = stream.into_split();
                        *writer_slot.lock().await = Some(write_half);
                        state.store(ConnState::Connected as u8, Ordering::Release);
                        info!("connected to {addr}");

                        read_lines(read_half, &events, &cancel).await;

                        writer_slot.lock().await.take();
                        state.store(ConnState::Disconnected as u8, Ordering::Release);
                    }
                    Err(e) => {
                        warn!("connection to {addr} failed: {e}");
                        state.store(ConnState::Disconnected as u8, Ordering::Release);
                    }
                }

                // Fixed backoff before the next attempt.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(RECONNECT_BACKOFF) => {}
                }
            }
            state.store(ConnState::Stopped as u8, Ordering::Release);
        }));
    }

    /// Best-effort synchronous send. Fails immediately when not connected;
    /// nothing is queued or retried.
    pub async fn send(&self, message: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            bail!("not connected to {}", self.addr);
        };
        writer.write_all(message.as_bytes()).await?;
        if !message.ends_with('\n') {
            writer.write_all(b"\n").await?;
        }
        Ok(())
    }

    /// Disable the receiver, unblock any pending connect/read, and wait for
    /// the control flow to observe the flag and exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.conn_task.take() {
            if let Err(e) = task.await {
                warn!("receiver task failed: {e}");
            }
        }
        self.writer.lock().await.take();
        self.state
            .store(ConnState::Stopped as u8, Ordering::Release);
        info!("disconnected from {}", self.addr);
    }
}

/// Read until EOF, error, or cancellation, extracting complete lines from
/// the accumulating buffer and delivering them in order.
async fn read_lines(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    events: &mpsc::UnboundedSender<ChangeEvent>,
    cancel: &CancellationToken,
) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 1024];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut chunk) => read,
        };
        let n = match read {
            Ok(0) => {
                warn!("server closed the connection");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("read error: {e}");
                return;
            }
        };

        buf.extend_from_slice(&chunk[..n]);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.split_to(pos + 1);
            let text = match std::str::from_utf8(&line[..pos]) {
                Ok(text) => text,
                Err(_) => {
                    warn!("discarding non-UTF-8 line");
                    continue;
                }
            };
            match ChangeEvent::parse_line(text) {
                Ok(event) => {
                    if events.send(event).is_err() {
                        // Handler side is gone; nothing left to deliver to.
                        return;
                    }
                }
                Err(e) => warn!("discarding malformed message ({e}): {text}"),
            }
        }
    }
}
