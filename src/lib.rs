//! External OpenOCD controller
//!
//! Drives an OpenOCD instance that someone else started: generates the gdb command sets for
//! each debug-session phase, talks to OpenOCD's TCL RPC port (commands terminated by 0x1A),
//! keeps retrying `rtt start` until the RTT control block is found, and tells the SWO decoder
//! where to read trace data from. Exposed over MCP for agents that drive gdb themselves.

pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod rtt_monitor;
pub mod session;
pub mod swo;
pub mod tcl_channel;
pub mod tools;

pub use config::{Args, Config, SessionConfig};
pub use controller::{ControllerEvent, ExternalServerController, ServerController};
pub use error::{ControllerError, Result};
pub use session::{DebugSession, EventSession, SessionEvent};
pub use tcl_channel::TclChannel;
pub use tools::ExternalControllerToolHandler;
