//! OpenOCD TCL socket channel
//!
//! Talks to the TCL server of an OpenOCD instance that someone else started.
//! Protocol: send command as UTF-8, terminated by 0x1a (SUB character).
//! Response: UTF-8 text terminated by 0x1a.
//!
//! The protocol carries no request ids. Responses are matched to commands strictly in the
//! order the commands were written, which holds only because OpenOCD answers every command
//! exactly once and in order. Nothing here can detect a server that breaks that rule.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::{ControllerError, Result};
use crate::session::Diagnostics;

/// TCL protocol terminator byte (ASCII SUB / Ctrl-Z)
pub const TCL_TERMINATOR: u8 = 0x1a;

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a channel. Once `Closed`, an instance never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unopened,
    Connecting,
    Open,
    Closed,
}

/// Splits a byte stream into 0x1a-terminated messages, carrying partial messages across reads
#[derive(Debug, Default)]
pub struct TclFramer {
    leftover: Vec<u8>,
}

impl TclFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every message it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut data = std::mem::take(&mut self.leftover);
        data.extend_from_slice(chunk);

        let mut segments: Vec<&[u8]> = data.split(|b| *b == TCL_TERMINATOR).collect();
        // split() always yields a final segment: empty when the chunk ended on a terminator,
        // otherwise the start of the next message
        let tail = segments.pop().unwrap_or_default();
        self.leftover = tail.to_vec();

        segments
            .into_iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }

    /// Bytes of an incomplete message waiting for its terminator
    pub fn pending_bytes(&self) -> usize {
        self.leftover.len()
    }
}

/// A command written to OpenOCD that is waiting for its response
struct PendingCommand {
    id: u64,
    command: String,
    completion: oneshot::Sender<String>,
}

/// Response to a submitted command.
///
/// Resolves with OpenOCD's reply. It does not resolve when the socket closes: the command is
/// left outstanding for as long as the channel instance lives, and only dropping the channel
/// completes it with `ChannelClosed`.
#[derive(Debug)]
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<String>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|r| r.map_err(|_| ControllerError::ChannelClosed))
    }
}

struct Shared {
    state: ChannelState,
    writer: Option<OwnedWriteHalf>,
    pending: VecDeque<PendingCommand>,
}

impl Shared {
    /// Hand a complete message to the oldest waiting command, or drop it as unsolicited
    fn dispatch(&mut self, message: String, diagnostics: &Diagnostics) {
        match self.pending.pop_front() {
            Some(next) => {
                diagnostics.log(&format!("openocd -> {}-'{}'", next.id, message));
                debug!("TCL response for '{}' ({} bytes)", next.command, message.len());
                // Receiver may have been dropped by a caller that stopped waiting
                let _ = next.completion.send(message);
            }
            None => {
                diagnostics.log(&format!("openocd -> '{}'", message.trim()));
            }
        }
    }

    fn close(&mut self) {
        if self.state != ChannelState::Closed {
            info!("OpenOCD TCL channel closed ({} commands unanswered)", self.pending.len());
        }
        self.state = ChannelState::Closed;
        self.writer = None;
    }
}

/// Persistent TCL RPC channel to an external OpenOCD
pub struct TclChannel {
    host: String,
    port: u16,
    shared: Arc<Mutex<Shared>>,
    // Serializes connection attempts without holding `shared` across the handshake
    connecting: Mutex<()>,
    reader: OnceLock<AbortHandle>,
    diagnostics: Diagnostics,
}

impl TclChannel {
    pub fn new(host: impl Into<String>, port: u16, diagnostics: Diagnostics) -> Self {
        Self {
            host: host.into(),
            port,
            shared: Arc::new(Mutex::new(Shared {
                state: ChannelState::Unopened,
                writer: None,
                pending: VecDeque::new(),
            })),
            connecting: Mutex::new(()),
            reader: OnceLock::new(),
            diagnostics,
        }
    }

    pub async fn state(&self) -> ChannelState {
        self.shared.lock().await.state
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == ChannelState::Open
    }

    /// Commands written but not yet answered
    pub async fn pending_count(&self) -> usize {
        self.shared.lock().await.pending.len()
    }

    /// Open the socket if it was never opened.
    ///
    /// Returns immediately when already open. A channel that failed or was closed stays
    /// closed: this returns `ChannelClosed` without touching the network.
    pub async fn connect(&self) -> Result<()> {
        let _attempt = self.connecting.lock().await;
        {
            let mut shared = self.shared.lock().await;
            match shared.state {
                ChannelState::Open => return Ok(()),
                ChannelState::Closed => return Err(ControllerError::ChannelClosed),
                // Connecting is only seen here if an earlier connect() was cancelled mid-flight
                ChannelState::Unopened | ChannelState::Connecting => {}
            }
            shared.state = ChannelState::Connecting;
        }

        debug!("Connecting to OpenOCD TCL at {}:{}", self.host, self.port);
        let result = TcpStream::connect((self.host.as_str(), self.port)).await;

        let mut shared = self.shared.lock().await;
        if shared.state == ChannelState::Closed {
            // shutdown() ran while the handshake was in flight
            return Err(ControllerError::ChannelClosed);
        }
        match result {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                shared.writer = Some(write_half);
                shared.state = ChannelState::Open;

                let reader = tokio::spawn(read_loop(
                    read_half,
                    self.shared.clone(),
                    self.diagnostics.clone(),
                ));
                let _ = self.reader.set(reader.abort_handle());

                info!("Connected to OpenOCD TCL on {}:{}", self.host, self.port);
                Ok(())
            }
            Err(e) => {
                shared.state = ChannelState::Closed;
                Err(ControllerError::ConnectionFailed(format!(
                    "Failed to connect to OpenOCD TCL port {}:{}: {}",
                    self.host, self.port, e
                )))
            }
        }
    }

    /// Write a command and return a future for its response without waiting on it.
    ///
    /// Several commands may be outstanding at once; they are answered in submission order.
    /// An empty command resolves to an empty response without any network I/O.
    pub async fn submit(&self, command: &str) -> Result<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        let id = NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed);

        if command.is_empty() {
            let _ = tx.send(String::new());
            return Ok(PendingResponse { id, rx });
        }

        self.connect().await?;

        let mut shared = self.shared.lock().await;
        let Some(writer) = shared.writer.as_mut() else {
            return Err(ControllerError::ChannelClosed);
        };

        let mut payload = command.as_bytes().to_vec();
        payload.push(TCL_TERMINATOR);

        if let Err(e) = writer.write_all(&payload).await {
            warn!("TCL write failed, closing channel: {}", e);
            shared.close();
            return Err(ControllerError::Transport(format!("Write failed: {}", e)));
        }

        self.diagnostics.log(&format!("openocd <- {}-{}", id, command));
        // The reader needs this lock to dispatch, so queue order always matches wire order
        shared.pending.push_back(PendingCommand {
            id,
            command: command.to_string(),
            completion: tx,
        });

        Ok(PendingResponse { id, rx })
    }

    /// Send a TCL command and wait for its response
    pub async fn send(&self, command: &str) -> Result<String> {
        self.submit(command).await?.await
    }

    /// Close the socket for good
    pub async fn shutdown(&self) {
        if let Some(reader) = self.reader.get() {
            reader.abort();
        }
        self.shared.lock().await.close();
    }
}

impl Drop for TclChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get() {
            reader.abort();
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Mutex<Shared>>, diagnostics: Diagnostics) {
    let mut framer = TclFramer::new();
    let mut buf = vec![0u8; 4096];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("OpenOCD closed the TCL connection");
                break;
            }
            Ok(n) => {
                let messages = framer.push(&buf[..n]);
                if messages.is_empty() {
                    continue;
                }
                let mut shared = shared.lock().await;
                for message in messages {
                    shared.dispatch(message, &diagnostics);
                }
            }
            Err(e) => {
                warn!("TCL read failed: {}", e);
                break;
            }
        }
    }

    shared.lock().await.close();
}
