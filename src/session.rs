//! Boundary to the host debug session
//!
//! The session pushes typed events to each subscriber over its own unbounded queue and accepts
//! log lines back. No event is dropped for a slow subscriber. Subscribers unregister by dropping
//! their receiver.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Pause reason reported when the program stops at its entry point
pub const STOP_REASON_ENTRY: &str = "entry";

/// Output channel of a session message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCategory {
    Console,
    Stdout,
    Stderr,
    Log,
}

/// Events a debug session delivers to its subscribers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Raw output from gdb, including `monitor` replies relayed from OpenOCD. Arbitrary chunks.
    Output { category: OutputCategory, text: String },
    /// Execution paused
    Stopped { reason: String, info: serde_json::Value },
    /// The debugger finished attaching/launching
    AttachComplete,
}

/// The host debug session as seen by a server controller
pub trait DebugSession: Send + Sync {
    /// Register for session events
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent>;

    /// Show a message to the user in the given category
    fn handle_msg(&self, category: OutputCategory, text: &str);
}

/// Diagnostic sink: always traced, forwarded to the session log only when verbose
#[derive(Clone, Default)]
pub struct Diagnostics {
    verbose: bool,
    session: Option<Arc<dyn DebugSession>>,
}

impl Diagnostics {
    pub fn new(verbose: bool, session: Option<Arc<dyn DebugSession>>) -> Self {
        Self { verbose, session }
    }

    pub fn log(&self, message: &str) {
        debug!("{}", message);
        if !self.verbose {
            return;
        }
        if let Some(session) = &self.session {
            session.handle_msg(OutputCategory::Log, &format!("{}\n", message));
        }
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("verbose", &self.verbose)
            .field("session", &self.session.is_some())
            .finish()
    }
}

/// Fan-out session used by the MCP server and by tests
#[derive(Default)]
pub struct EventSession {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
    log: Mutex<Vec<String>>,
}

impl EventSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event; returns how many subscribers received it
    pub fn emit(&self, event: SessionEvent) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn output(&self, text: impl Into<String>) -> usize {
        self.emit(SessionEvent::Output { category: OutputCategory::Console, text: text.into() })
    }

    pub fn stopped(&self, reason: impl Into<String>) -> usize {
        self.emit(SessionEvent::Stopped { reason: reason.into(), info: serde_json::Value::Null })
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers.retain(|tx| !tx.is_closed());
                subscribers.len()
            }
            Err(_) => 0,
        }
    }

    /// Take all log lines collected so far
    pub fn drain_log(&self) -> Vec<String> {
        match self.log.lock() {
            Ok(mut log) => std::mem::take(&mut *log),
            Err(_) => Vec::new(),
        }
    }
}

impl DebugSession for EventSession {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    fn handle_msg(&self, category: OutputCategory, text: &str) {
        if let Ok(mut log) = self.log.lock() {
            log.push(format!("[{:?}] {}", category, text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_quiet_by_default() {
        let session = Arc::new(EventSession::default());
        let quiet = Diagnostics::new(false, Some(session.clone()));
        quiet.log("openocd <- 1-rtt start");
        assert!(session.drain_log().is_empty());

        let verbose = Diagnostics::new(true, Some(session.clone()));
        verbose.log("openocd <- 2-rtt start");
        let log = session.drain_log();
        assert_eq!(log.len(), 1);
        assert!(log[0].contains("2-rtt start"));
    }

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let session = EventSession::default();
        assert_eq!(session.output("ignored"), 0);

        let mut rx = session.subscribe();
        assert_eq!(session.subscriber_count(), 1);
        assert_eq!(session.stopped("breakpoint-hit"), 1);
        match rx.recv().await.unwrap() {
            SessionEvent::Stopped { reason, .. } => assert_eq!(reason, "breakpoint-hit"),
            other => panic!("unexpected event {:?}", other),
        }

        drop(rx);
        assert_eq!(session.subscriber_count(), 0);
        assert_eq!(session.stopped("step"), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_keeps_every_event() {
        let session = EventSession::new();
        let mut rx = session.subscribe();
        for i in 0..1000 {
            session.output(format!("line {}\n", i));
        }

        for i in 0..1000 {
            match rx.recv().await.unwrap() {
                SessionEvent::Output { text, .. } => assert_eq!(text, format!("line {}\n", i)),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }
}
