//! RMCP 0.3.2 tools exposing the external OpenOCD controller
//!
//! An agent driving gdb stands in for the debug session: it feeds gdb output and stop events
//! in, and gets command sets, TCL replies, SWO transport and RTT state back.

use rmcp::{
    tool, tool_router, tool_handler, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::*,
    ErrorData as McpError,
};
use serde_json::json;
use tracing::{info, warn};
use std::future::Future;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::types::*;
use crate::config::{Config, SessionConfig, TCL_PORT_NAME};
use crate::controller::{ControllerEvent, ExternalServerController, ServerController};
use crate::session::{EventSession, SessionEvent};

/// One controller plus the session surrogate feeding it
struct ManagedSession {
    controller: ExternalServerController,
    session: Arc<EventSession>,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
}

/// External OpenOCD controller tool handler
#[derive(Clone)]
pub struct ExternalControllerToolHandler {
    #[allow(dead_code)]
    tool_router: ToolRouter<ExternalControllerToolHandler>,
    config: Config,
    sessions: Arc<RwLock<HashMap<String, Arc<Mutex<ManagedSession>>>>>,
}

impl Default for ExternalControllerToolHandler {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl ExternalControllerToolHandler {
    pub fn new(config: Config) -> Self {
        Self {
            tool_router: Self::tool_router(),
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get a session by ID, returning an MCP error if not found
    async fn get_session(&self, session_id: &str) -> Result<Arc<Mutex<ManagedSession>>, McpError> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned().ok_or_else(|| {
            McpError::invalid_params(format!("Session not found: {}", session_id), None)
        })
    }

    /// Resolve the session configuration from args, CLI default, or built-in default
    fn load_session_config(&self, args: &CreateSessionArgs) -> Result<SessionConfig, McpError> {
        let mut config = if let Some(value) = &args.config {
            serde_json::from_value::<SessionConfig>(value.clone()).map_err(|e| {
                McpError::invalid_params(format!("Invalid session config: {}", e), None)
            })?
        } else if let Some(path) = args.config_file.as_deref().map(Path::new)
            .or(self.config.default_session_config.as_deref())
        {
            SessionConfig::load(path).map_err(|e| McpError::invalid_params(e.to_string(), None))?
        } else {
            SessionConfig::default()
        };

        if config.tcl_port().is_none() {
            let port = args.tcl_port.unwrap_or(self.config.tcl_port);
            config.ports.insert(TCL_PORT_NAME.to_string(), port);
        }
        if self.config.show_dev_debug_output {
            config.show_dev_debug_output = true;
        }
        Ok(config)
    }
}

fn make_error(msg: impl Into<String>) -> McpError {
    McpError::internal_error(msg.into(), None)
}

fn json_result(value: serde_json::Value) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(&value)
        .map_err(|e| make_error(format!("Failed to serialize result: {}", e)))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

#[tool_router]
impl ExternalControllerToolHandler {
    // =========================================================================
    // Session Management (2 tools)
    // =========================================================================

    #[tool(description = "Create a controller for an already running OpenOCD. Returns session_id for use with other tools.")]
    async fn create_session(&self, Parameters(args): Parameters<CreateSessionArgs>) -> Result<CallToolResult, McpError> {
        let config = self.load_session_config(&args)?;

        let (mut controller, events) = ExternalServerController::new(config)
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;
        let session = Arc::new(EventSession::default());
        controller.debugger_launch_started(session.clone());

        let session_id = uuid::Uuid::new_v4().to_string();
        let summary = json!({
            "session_id": session_id,
            "gdb_target": controller.config().gdb_target,
            "tcl_port": controller.config().tcl_port(),
            "rtt_enabled": controller.rtt_config().enabled,
            "swo_enabled": controller.config().swo_config.enabled,
        });

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(
                session_id.clone(),
                Arc::new(Mutex::new(ManagedSession { controller, session, events })),
            );
        }

        info!("Session {} created", session_id);
        json_result(summary)
    }

    #[tool(description = "Stop the RTT monitor, close the TCL channel and release the session")]
    async fn close_session(&self, Parameters(args): Parameters<SessionIdArgs>) -> Result<CallToolResult, McpError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&args.session_id)
        };

        match session {
            Some(session) => {
                let mut session = session.lock().await;
                session.controller.shutdown().await;
                info!("Session {} closed", args.session_id);
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "Session {} closed", args.session_id
                ))]))
            }
            None => Err(McpError::invalid_params(
                format!("Session not found: {}", args.session_id),
                None,
            )),
        }
    }

    // =========================================================================
    // Command Sets (1 tool)
    // =========================================================================

    #[tool(description = "Get the gdb command list for a lifecycle phase: init, launch, attach, restart, rtt, swo_and_rtt, server_arguments")]
    async fn get_commands(&self, Parameters(args): Parameters<GetCommandsArgs>) -> Result<CallToolResult, McpError> {
        let session = self.get_session(&args.session_id).await?;
        let session = session.lock().await;
        let controller = &session.controller;

        let commands = match args.phase.as_str() {
            "init" => controller.init_commands(),
            "launch" => controller.launch_commands(),
            "attach" => Ok(controller.attach_commands()),
            "restart" => Ok(controller.restart_commands()),
            "rtt" => Ok(controller.rtt_commands()),
            "swo_and_rtt" => Ok(controller.swo_and_rtt_commands()),
            "server_arguments" => Ok(controller.server_arguments()),
            other => {
                return Err(McpError::invalid_params(
                    format!("Unknown phase '{}'", other),
                    None,
                ))
            }
        }
        .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

        json_result(json!({ "phase": args.phase, "commands": commands }))
    }

    // =========================================================================
    // TCL Channel (1 tool)
    // =========================================================================

    #[tool(description = "Send a TCL command to OpenOCD over the session's persistent TCL channel")]
    async fn tcl_command(&self, Parameters(args): Parameters<TclCommandArgs>) -> Result<CallToolResult, McpError> {
        let channel = {
            let session = self.get_session(&args.session_id).await?;
            let mut session = session.lock().await;
            session.controller.channel().map_err(|e| make_error(e.to_string()))?
        };

        let reply = tokio::time::timeout(Duration::from_millis(args.timeout_ms), channel.send(&args.command))
            .await
            .map_err(|_| make_error(format!(
                "No reply to '{}' within {} ms (the command stays queued)",
                args.command, args.timeout_ms
            )))?
            .map_err(|e| {
                if e.is_channel_failure() {
                    make_error(format!("{} (close and recreate the session to reconnect)", e))
                } else {
                    make_error(format!("OpenOCD command failed: {}", e))
                }
            })?;

        Ok(CallToolResult::success(vec![Content::text(reply)]))
    }

    // =========================================================================
    // Session Events (4 tools)
    // =========================================================================

    #[tool(description = "Report that OpenOCD finished launching. Returns the SWO transport announcement, if any.")]
    async fn server_launched(&self, Parameters(args): Parameters<SessionIdArgs>) -> Result<CallToolResult, McpError> {
        let session = self.get_session(&args.session_id).await?;
        let mut session = session.lock().await;

        session.controller.server_launch_started();
        session.controller.server_launch_completed();

        let mut announced = Vec::new();
        while let Ok(event) = session.events.try_recv() {
            announced.push(event);
        }
        json_result(json!({ "events": announced }))
    }

    #[tool(description = "Feed a chunk of raw gdb/OpenOCD output to the session")]
    async fn session_output(&self, Parameters(args): Parameters<SessionOutputArgs>) -> Result<CallToolResult, McpError> {
        let session = self.get_session(&args.session_id).await?;
        let session = session.lock().await;
        let delivered = session.session.output(args.text);
        json_result(json!({ "delivered_to": delivered }))
    }

    #[tool(description = "Report that the target stopped, with gdb's stop reason")]
    async fn session_stopped(&self, Parameters(args): Parameters<SessionStoppedArgs>) -> Result<CallToolResult, McpError> {
        let session = self.get_session(&args.session_id).await?;
        let session = session.lock().await;
        let delivered = session.session.stopped(args.reason);
        json_result(json!({ "delivered_to": delivered }))
    }

    #[tool(description = "Report that gdb finished attaching. Starts the RTT monitor when RTT is enabled.")]
    async fn attach_complete(&self, Parameters(args): Parameters<SessionIdArgs>) -> Result<CallToolResult, McpError> {
        let session = self.get_session(&args.session_id).await?;
        let mut session = session.lock().await;

        session.session.emit(SessionEvent::AttachComplete);
        session.controller.debugger_launch_completed();

        let monitoring = session.controller.rtt_status().is_some();
        if !monitoring && session.controller.rtt_config().enabled {
            warn!("RTT enabled but monitor did not start for session {}", args.session_id);
        }
        json_result(json!({ "rtt_monitor": monitoring }))
    }

    // =========================================================================
    // RTT (1 tool)
    // =========================================================================

    #[tool(description = "Get RTT start state and any diagnostic log lines collected for the session")]
    async fn rtt_status(&self, Parameters(args): Parameters<SessionIdArgs>) -> Result<CallToolResult, McpError> {
        let session = self.get_session(&args.session_id).await?;
        let session = session.lock().await;

        let running = session.controller.rtt_monitor().map(|m| m.is_running()).unwrap_or(false);
        json_result(json!({
            "monitor_running": running,
            "status": session.controller.rtt_status(),
            "log": session.session.drain_log(),
        }))
    }
}

#[tool_handler]
impl ServerHandler for ExternalControllerToolHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "External OpenOCD controller - drives an OpenOCD instance started elsewhere. \
                 9 tools available: create_session, close_session, get_commands, tcl_command, \
                 server_launched, session_output, session_stopped, attach_complete, rtt_status.".to_string()
            ),
        }
    }
}
