//! Type definitions for the openocd-external MCP tools

use serde::Deserialize;
use schemars::JsonSchema;

// ============================================================================
// create_session
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateSessionArgs {
    /// Session configuration file (.toml or .json). Falls back to --config when omitted.
    #[serde(default)]
    pub config_file: Option<String>,
    /// Inline session configuration (same keys as the file form, e.g. {"gdbTarget": ":3333"})
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    /// TCL port of the running OpenOCD, if the configuration does not allocate one
    #[serde(default)]
    pub tcl_port: Option<u16>,
}

// ============================================================================
// session-scoped tools without extra arguments
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionIdArgs {
    /// Session ID returned by create_session
    pub session_id: String,
}

// ============================================================================
// get_commands
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetCommandsArgs {
    /// Session ID
    pub session_id: String,
    /// Lifecycle phase: init, launch, attach, restart, rtt, swo_and_rtt, server_arguments
    pub phase: String,
}

// ============================================================================
// tcl_command
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TclCommandArgs {
    /// Session ID
    pub session_id: String,
    /// TCL command for OpenOCD (e.g., "targets", "rtt start")
    pub command: String,
    /// How long to wait for the reply (default: 10000 ms)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 { 10_000 }

// ============================================================================
// session_output
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionOutputArgs {
    /// Session ID
    pub session_id: String,
    /// Raw gdb/OpenOCD output chunk, line endings included
    pub text: String,
}

// ============================================================================
// session_stopped
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionStoppedArgs {
    /// Session ID
    pub session_id: String,
    /// Stop reason as reported by gdb (e.g., "breakpoint-hit", "entry")
    pub reason: String,
}
