//! RTT start monitor
//!
//! `monitor rtt start` is sent during launch, usually before the firmware has set up its
//! control block. This watches gdb output for OpenOCD announcing the block and, until it shows
//! up, resends `rtt start` over the TCL channel every time the target pauses.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::config::ResolvedRttConfig;
use crate::session::{Diagnostics, SessionEvent, STOP_REASON_ENTRY};
use crate::tcl_channel::TclChannel;

/// OpenOCD output once it has located the control block
pub const RTT_FOUND_MARKER: &str = "Control block found at";

/// Newer OpenOCD versions keep polling on their own and say so
static AUTO_RETRY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"rtt:.*will retry").expect("static regex"));

/// Reassembles newline-terminated lines from arbitrarily chunked output
#[derive(Debug, Default)]
pub struct LineAssembler {
    leftover: String,
}

impl LineAssembler {
    /// Feed one chunk, returning the lines it completes (without line endings)
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut text = std::mem::take(&mut self.leftover);
        text.push_str(chunk);

        let mut lines: Vec<String> = text
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
            .collect();
        // Last piece is either empty (chunk ended with a newline) or an unfinished line
        self.leftover = lines.pop().unwrap_or_default();
        lines
    }
}

/// What a chunk of output changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputOutcome {
    Unchanged,
    AutoRetryDetected,
    Started,
}

/// Snapshot of the monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RttStatus {
    pub started: bool,
    pub auto_detected: bool,
    pub retries_issued: u64,
}

/// Event-driven state of the RTT start handshake. Both flags are terminal once set.
#[derive(Debug)]
pub struct RttMonitor {
    lines: LineAssembler,
    started: bool,
    auto_detected: bool,
    retries_issued: u64,
    retry_budget: u64,
}

impl RttMonitor {
    pub fn new(retry_budget: u64) -> Self {
        Self {
            lines: LineAssembler::default(),
            started: false,
            auto_detected: false,
            retries_issued: 0,
            retry_budget,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_auto_detected(&self) -> bool {
        self.auto_detected
    }

    pub fn status(&self) -> RttStatus {
        RttStatus {
            started: self.started,
            auto_detected: self.auto_detected,
            retries_issued: self.retries_issued,
        }
    }

    /// Process a chunk of raw session output
    pub fn on_output(&mut self, chunk: &str) -> OutputOutcome {
        if self.started {
            return OutputOutcome::Unchanged;
        }

        let mut outcome = OutputOutcome::Unchanged;
        for line in self.lines.push(chunk) {
            trace!("OpenOCD output: {}", line);
            if line.contains(RTT_FOUND_MARKER) {
                self.started = true;
                return OutputOutcome::Started;
            }
            if !self.auto_detected && AUTO_RETRY_PATTERN.is_match(&line) {
                self.auto_detected = true;
                outcome = OutputOutcome::AutoRetryDetected;
            }
        }
        outcome
    }

    /// Process a pause. Returns true when an `rtt start` retry should go out now.
    pub fn on_stopped(&mut self, reason: &str, channel_open: bool) -> bool {
        if reason == STOP_REASON_ENTRY {
            return false;
        }
        if self.started || self.auto_detected || !channel_open {
            return false;
        }
        if self.retries_issued >= self.retry_budget {
            return false;
        }
        self.retries_issued += 1;
        true
    }
}

/// Running monitor task. Dropping the handle unsubscribes it from the session.
#[derive(Debug)]
pub struct RttMonitorHandle {
    task: JoinHandle<()>,
    status: watch::Receiver<RttStatus>,
}

impl RttMonitorHandle {
    pub fn status(&self) -> RttStatus {
        *self.status.borrow()
    }

    /// Wait until the control block has been found. Returns false if the monitor ended first.
    pub async fn wait_started(&self) -> bool {
        let mut status = self.status.clone();
        let started = status.wait_for(|s| s.started).await.is_ok();
        started
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for RttMonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start watching session events. The subscription must already exist so no event between
/// activation and the first poll of the task is missed.
pub fn spawn_rtt_monitor(
    events: mpsc::UnboundedReceiver<SessionEvent>,
    channel: Arc<TclChannel>,
    rtt: &ResolvedRttConfig,
    diagnostics: Diagnostics,
) -> RttMonitorHandle {
    let monitor = RttMonitor::new(rtt.retry_budget());
    let (status_tx, status) = watch::channel(monitor.status());
    let task = tokio::spawn(run_monitor(events, channel, monitor, status_tx, diagnostics));
    RttMonitorHandle { task, status }
}

async fn run_monitor(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    channel: Arc<TclChannel>,
    mut monitor: RttMonitor,
    status: watch::Sender<RttStatus>,
    diagnostics: Diagnostics,
) {
    // Retries still waiting on their reply; dropped with the monitor
    let mut in_flight: JoinSet<()> = JoinSet::new();

    // Activation opens the TCL channel; without it pauses cannot trigger retries
    if let Err(e) = channel.connect().await {
        warn!("RTT monitor has no TCL channel, retries disabled: {}", e);
    }

    while let Some(event) = events.recv().await {
        while in_flight.try_join_next().is_some() {}

        match event {
            SessionEvent::Output { text, .. } => match monitor.on_output(&text) {
                OutputOutcome::Started => {
                    diagnostics.log("RTT control block found. Done");
                    in_flight.abort_all();
                }
                OutputOutcome::AutoRetryDetected => {
                    diagnostics.log("This version of OpenOCD already knows how to poll. Done");
                }
                OutputOutcome::Unchanged => {}
            },
            SessionEvent::Stopped { reason, .. } => {
                let open = channel.is_open().await;
                if monitor.on_stopped(&reason, open) {
                    diagnostics.log("Debugger paused: sending command \"rtt start\"");
                    match channel.submit("rtt start").await {
                        Ok(pending) => {
                            let diagnostics = diagnostics.clone();
                            in_flight.spawn(async move {
                                match pending.await {
                                    Ok(reply) => diagnostics.log(&format!("rtt start -> '{}'", reply.trim())),
                                    Err(e) => debug!("rtt start retry got no reply: {}", e),
                                }
                            });
                        }
                        // Best effort; the next pause tries again
                        Err(e) => debug!("rtt start retry failed: {}", e),
                    }
                }
            }
            SessionEvent::AttachComplete => {}
        }

        status.send_replace(monitor.status());
        if monitor.is_started() {
            info!("RTT started after {} retries", monitor.status().retries_issued);
            break;
        }
    }
}
