//! Server controller for an OpenOCD instance managed outside the debug session
//!
//! The controller never starts or stops OpenOCD. It hands the session the gdb command sets for
//! each lifecycle phase, announces the SWO transport, and once the debugger is attached keeps
//! nudging `rtt start` through the TCL port until OpenOCD finds the RTT control block.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::commands;
use crate::config::{parse_host_port, ResolvedRttConfig, SessionConfig};
use crate::error::{ControllerError, Result};
use crate::rtt_monitor::{spawn_rtt_monitor, RttMonitorHandle, RttStatus};
use crate::session::{DebugSession, Diagnostics};
use crate::swo::{Platform, SwoConfigurator, SwoTransport};
use crate::tcl_channel::TclChannel;

/// Notifications for collaborators outside the debug session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "body", rename_all = "kebab-case")]
pub enum ControllerEvent {
    /// Where the SWO decoder should read trace data from
    SwoConfigure(SwoTransport),
}

/// Lifecycle hooks a debug session drives on its gdb-server controller
pub trait ServerController {
    fn name(&self) -> &'static str;

    /// Logical ports the controller wants allocated
    fn ports_needed(&self) -> &'static [&'static str];

    fn set_ports(&mut self, ports: HashMap<String, u16>);

    fn init_commands(&self) -> Result<Vec<String>>;
    fn launch_commands(&self) -> Result<Vec<String>>;
    fn attach_commands(&self) -> Vec<String>;
    fn restart_commands(&self) -> Vec<String>;
    fn swo_and_rtt_commands(&self) -> Vec<String>;
    fn rtt_commands(&self) -> Vec<String>;

    fn server_executable(&self) -> Option<PathBuf>;
    fn server_arguments(&self) -> Vec<String>;

    /// Pattern in the server's output that signals it is ready
    fn init_match(&self) -> Option<Regex>;

    fn server_launch_started(&mut self);
    fn server_launch_completed(&mut self);
    fn debugger_launch_started(&mut self, session: Arc<dyn DebugSession>);
    fn debugger_launch_completed(&mut self);
}

/// Controller for an externally managed OpenOCD
pub struct ExternalServerController {
    config: SessionConfig,
    rtt: ResolvedRttConfig,
    swo: SwoConfigurator,
    events: mpsc::UnboundedSender<ControllerEvent>,
    session: Option<Arc<dyn DebugSession>>,
    channel: Option<Arc<TclChannel>>,
    monitor: Option<RttMonitorHandle>,
}

impl ExternalServerController {
    /// Build a controller and the receiver for its outbound events
    pub fn new(config: SessionConfig) -> Result<(Self, mpsc::UnboundedReceiver<ControllerEvent>)> {
        Self::with_platform(config, Platform::current())
    }

    pub fn with_platform(
        config: SessionConfig,
        platform: Platform,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ControllerEvent>)> {
        config.validate()?;
        let rtt = config.rtt_config.resolve();
        let swo = SwoConfigurator::new(config.swo_config.clone(), platform)?;
        let (events, events_rx) = mpsc::unbounded_channel();

        debug!("External controller for {} (rtt retry {})", config.gdb_target, rtt.rtt_start_retry);
        Ok((
            Self {
                config,
                rtt,
                swo,
                events,
                session: None,
                channel: None,
                monitor: None,
            },
            events_rx,
        ))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// RTT settings with defaults applied at construction
    pub fn rtt_config(&self) -> &ResolvedRttConfig {
        &self.rtt
    }

    /// Private path OpenOCD writes probe-captured SWO data to, when the probe captures it
    pub fn swo_path(&self) -> Option<&str> {
        self.swo.private_path()
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics::new(self.config.show_dev_debug_output, self.session.clone())
    }

    /// The TCL channel, created on first use
    pub fn channel(&mut self) -> Result<Arc<TclChannel>> {
        if let Some(channel) = &self.channel {
            return Ok(channel.clone());
        }

        let (host, _) = parse_host_port(&self.config.gdb_target)?;
        let port = self.config.tcl_port().ok_or_else(|| {
            ControllerError::InvalidConfig("no tclPort allocated for this session".to_string())
        })?;
        let channel = Arc::new(TclChannel::new(host, port, self.diagnostics()));
        self.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Run a TCL command on the external OpenOCD
    pub async fn tcl_command(&mut self, command: &str) -> Result<String> {
        let channel = self.channel()?;
        channel.send(command).await
    }

    /// RTT monitor state, once the monitor is running
    pub fn rtt_status(&self) -> Option<RttStatus> {
        self.monitor.as_ref().map(RttMonitorHandle::status)
    }

    pub fn rtt_monitor(&self) -> Option<&RttMonitorHandle> {
        self.monitor.as_ref()
    }

    /// Stop the monitor and close the TCL channel
    pub async fn shutdown(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        if let Some(channel) = self.channel.take() {
            channel.shutdown().await;
        }
        info!("External controller for {} shut down", self.config.gdb_target);
    }

    fn emit(&self, event: ControllerEvent) {
        if self.events.send(event).is_err() {
            debug!("No listener for controller events");
        }
    }
}

impl ServerController for ExternalServerController {
    fn name(&self) -> &'static str {
        "External"
    }

    fn ports_needed(&self) -> &'static [&'static str] {
        &[]
    }

    fn set_ports(&mut self, ports: HashMap<String, u16>) {
        self.config.ports = ports;
    }

    fn init_commands(&self) -> Result<Vec<String>> {
        commands::init_commands(&self.config)
    }

    fn launch_commands(&self) -> Result<Vec<String>> {
        commands::launch_commands(&self.config)
    }

    fn attach_commands(&self) -> Vec<String> {
        commands::attach_commands()
    }

    fn restart_commands(&self) -> Vec<String> {
        commands::restart_commands()
    }

    fn swo_and_rtt_commands(&self) -> Vec<String> {
        Vec::new()
    }

    fn rtt_commands(&self) -> Vec<String> {
        commands::rtt_commands(&self.config, &self.rtt)
    }

    fn server_executable(&self) -> Option<PathBuf> {
        None
    }

    fn server_arguments(&self) -> Vec<String> {
        Vec::new()
    }

    fn init_match(&self) -> Option<Regex> {
        None
    }

    fn server_launch_started(&mut self) {
        if let Some(transport) = self.swo.server_launch_started() {
            self.emit(ControllerEvent::SwoConfigure(transport));
        }
    }

    fn server_launch_completed(&mut self) {
        if let Some(transport) = self.swo.server_launch_completed() {
            self.emit(ControllerEvent::SwoConfigure(transport));
        }
    }

    fn debugger_launch_started(&mut self, session: Arc<dyn DebugSession>) {
        self.session = Some(session);
    }

    fn debugger_launch_completed(&mut self) {
        if !self.rtt.enabled || self.monitor.is_some() {
            return;
        }
        let Some(session) = self.session.clone() else {
            debug!("Debugger attached without a session; RTT monitor not started");
            return;
        };
        let channel = match self.channel() {
            Ok(channel) => channel,
            Err(e) => {
                info!("RTT monitor disabled: {}", e);
                return;
            }
        };

        let events = session.subscribe();
        self.monitor = Some(spawn_rtt_monitor(events, channel, &self.rtt, self.diagnostics()));
        info!("RTT monitor started");
    }
}
