//! Configuration for the openocd-external controller
//!
//! Two layers live here: the CLI `Args`/`Config` pair used by the MCP server binary, and the
//! per-session `SessionConfig` handed to a controller instance (loaded from TOML or JSON).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};

/// Default OpenOCD TCL port
pub const DEFAULT_TCL_PORT: u16 = 6666;

/// Retry setting applied when `rtt_start_retry` is left unset
pub const DEFAULT_RTT_START_RETRY: i64 = 1000;

/// Logical name of the TCL RPC port in the port map
pub const TCL_PORT_NAME: &str = "tclPort";

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "openocd-external")]
#[command(about = "MCP server driving an externally managed OpenOCD instance")]
#[command(version)]
pub struct Args {
    /// Default session configuration file (TOML or JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// TCL port of the external OpenOCD when a session does not name one
    #[arg(long, default_value_t = DEFAULT_TCL_PORT)]
    pub tcl_port: u16,

    /// Forward TCL traffic and RTT monitor diagnostics to the session log
    #[arg(long)]
    pub show_dev_debug_output: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log file path (defaults to stderr)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone)]
pub struct Config {
    /// Session config used when `create_session` is called without one
    pub default_session_config: Option<PathBuf>,
    /// Fallback TCL port
    pub tcl_port: u16,
    /// Force verbose diagnostics on every session
    pub show_dev_debug_output: bool,
}

impl Config {
    pub fn from_args(args: &Args) -> Self {
        Self {
            default_session_config: args.config.clone(),
            tcl_port: args.tcl_port,
            show_dev_debug_output: args.show_dev_debug_output,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_session_config: None,
            tcl_port: DEFAULT_TCL_PORT,
            show_dev_debug_output: false,
        }
    }
}

/// Kind of request that started the debug session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    #[default]
    Launch,
    Attach,
}

/// Where SWO trace data is captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SwoSource {
    #[default]
    Probe,
    File,
    Socket,
    Serial,
}

/// SWO trace configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SwoConfig {
    pub enabled: bool,
    pub source: SwoSource,
    /// File path for `file`, device path for `serial`
    pub swo_path: Option<String>,
    /// TCP port for `socket`
    pub swo_port: Option<u16>,
    /// Baud rate for `serial`
    pub swo_frequency: Option<u32>,
}

/// RTT configuration as supplied by the user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RttConfig {
    pub enabled: bool,
    /// Control block search address, e.g. "0x20000000"
    pub address: String,
    /// Number of bytes searched for the control block id
    pub search_size: u32,
    /// Control block id string
    pub search_id: String,
    /// Zero the search region before a fresh launch
    pub clear_search: bool,
    #[serde(rename = "polling_interval", alias = "pollingInterval")]
    pub polling_interval: u32,
    #[serde(rename = "rtt_start_retry", alias = "rttStartRetry")]
    pub rtt_start_retry: Option<i64>,
}

impl Default for RttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            search_size: 16,
            search_id: "SEGGER RTT".to_string(),
            clear_search: true,
            polling_interval: 0,
            rtt_start_retry: None,
        }
    }
}

impl RttConfig {
    /// Fill in lazily-defaulted fields once, without touching the shared config
    pub fn resolve(&self) -> ResolvedRttConfig {
        ResolvedRttConfig {
            enabled: self.enabled,
            address: self.address.clone(),
            search_size: self.search_size,
            search_id: self.search_id.clone(),
            clear_search: self.clear_search,
            polling_interval: self.polling_interval,
            rtt_start_retry: self.rtt_start_retry.unwrap_or(DEFAULT_RTT_START_RETRY),
        }
    }
}

/// RTT configuration with every default applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRttConfig {
    pub enabled: bool,
    pub address: String,
    pub search_size: u32,
    pub search_id: String,
    pub clear_search: bool,
    pub polling_interval: u32,
    /// Upper bound on active `rtt start` retries; `<= 0` disables them
    pub rtt_start_retry: i64,
}

impl ResolvedRttConfig {
    /// Number of retries the monitor may issue
    pub fn retry_budget(&self) -> u64 {
        u64::try_from(self.rtt_start_retry).unwrap_or(0)
    }
}

/// Configuration of one debug session, read-only to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// "host:port" of OpenOCD's gdb server
    pub gdb_target: String,
    /// Program to download on launch when `load_files` is not given
    pub executable: Option<String>,
    /// Explicit list of files to download; an empty list disables download
    pub load_files: Option<Vec<String>>,
    pub request: RequestKind,
    /// Set while servicing an internal restart/reset pass
    pub pvt_restart_or_reset: bool,
    pub show_dev_debug_output: bool,
    pub swo_config: SwoConfig,
    pub rtt_config: RttConfig,
    /// Logical port name -> allocated port number
    pub ports: HashMap<String, u16>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gdb_target: "localhost:3333".to_string(),
            executable: None,
            load_files: None,
            request: RequestKind::Launch,
            pvt_restart_or_reset: false,
            show_dev_debug_output: false,
            swo_config: SwoConfig::default(),
            rtt_config: RttConfig::default(),
            ports: HashMap::new(),
        }
    }
}

impl SessionConfig {
    /// Load a session configuration from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ControllerError::InvalidConfig(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: SessionConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the fields the controller depends on are usable
    pub fn validate(&self) -> Result<()> {
        if self.gdb_target.trim().is_empty() {
            return Err(ControllerError::InvalidConfig("gdbTarget must not be empty".to_string()));
        }

        let rtt = &self.rtt_config;
        if rtt.enabled {
            if rtt.search_id.is_empty() {
                return Err(ControllerError::InvalidConfig(
                    "rttConfig.searchId must not be empty".to_string(),
                ));
            }
            if rtt.search_size == 0 {
                return Err(ControllerError::InvalidConfig(
                    "rttConfig.searchSize must be > 0".to_string(),
                ));
            }
            parse_address(&rtt.address)?;
        }

        let swo = &self.swo_config;
        if swo.enabled {
            match swo.source {
                SwoSource::Probe => {}
                SwoSource::File => {
                    if swo.swo_path.as_deref().map_or(true, str::is_empty) {
                        return Err(ControllerError::InvalidConfig(
                            "swoConfig.swoPath is required for source 'file'".to_string(),
                        ));
                    }
                }
                SwoSource::Socket => {
                    if swo.swo_port.is_none() {
                        return Err(ControllerError::InvalidConfig(
                            "swoConfig.swoPort is required for source 'socket'".to_string(),
                        ));
                    }
                }
                SwoSource::Serial => {
                    if swo.swo_path.as_deref().map_or(true, str::is_empty) {
                        return Err(ControllerError::InvalidConfig(
                            "swoConfig.swoPath (serial device) is required for source 'serial'"
                                .to_string(),
                        ));
                    }
                    if swo.swo_frequency == Some(0) {
                        return Err(ControllerError::InvalidConfig(
                            "swoConfig.swoFrequency must be > 0".to_string(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Port number allocated for a logical port name
    pub fn port(&self, name: &str) -> Option<u16> {
        self.ports.get(name).copied()
    }

    /// TCL port of the first (and only) OpenOCD instance
    pub fn tcl_port(&self) -> Option<u16> {
        self.port(&create_port_name(0, TCL_PORT_NAME))
    }
}

/// Name of a logical port for the given server process index
pub fn create_port_name(proc_num: usize, prefix: &str) -> String {
    if proc_num == 0 {
        prefix.to_string()
    } else {
        format!("{}{}", prefix, proc_num)
    }
}

/// Split "host:port", ":port" or "port" into its parts. Host defaults to 127.0.0.1.
pub fn parse_host_port(host_port: &str) -> Result<(String, u16)> {
    let s = host_port.trim();
    let (host, port) = match s.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("", s),
    };
    let port = port.parse::<u16>().map_err(|e| {
        ControllerError::InvalidConfig(format!("Invalid port in '{}': {}", host_port, e))
    })?;
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok((host.to_string(), port))
}

/// Parse an address written as hex ("0x20000000") or decimal
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
            .map_err(|e| ControllerError::InvalidConfig(format!("Invalid hex address '{}': {}", s, e)))
    } else {
        s.parse::<u64>()
            .map_err(|e| ControllerError::InvalidConfig(format!("Invalid address '{}': {}", s, e)))
    }
}
