//! SWO transport selection
//!
//! Decides where the trace-decoding client should read SWO data from and announces it once
//! per server launch.

use std::path::Path;

use serde::Serialize;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::config::{SwoConfig, SwoSource};
use crate::error::Result;

/// Host platform, as far as SWO capture cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// No mkfifo; probe-captured trace goes through a plain file
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    pub fn has_named_pipes(self) -> bool {
        self == Platform::Unix
    }
}

/// Transport the trace decoder should attach to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transportType", rename_all = "lowercase")]
pub enum SwoTransport {
    Fifo { path: String },
    File { path: String },
    Socket { port: u16 },
    Serial {
        device: String,
        #[serde(rename = "baudRate", skip_serializing_if = "Option::is_none")]
        baud_rate: Option<u32>,
    },
}

impl SwoTransport {
    /// Fifos are announced as soon as the server starts so the reader can open the pipe
    /// before OpenOCD writes to it. Everything else waits for the launch to complete.
    pub fn announced_at_launch_start(&self) -> bool {
        matches!(self, SwoTransport::Fifo { .. })
    }
}

/// Pure decision table over (source, platform)
pub fn select_transport(swo: &SwoConfig, platform: Platform, private_path: &str) -> Option<SwoTransport> {
    if !swo.enabled {
        return None;
    }

    match swo.source {
        SwoSource::Probe if platform.has_named_pipes() => {
            Some(SwoTransport::Fifo { path: private_path.to_string() })
        }
        SwoSource::Probe => Some(SwoTransport::File { path: private_path.to_string() }),
        SwoSource::Socket => swo.swo_port.map(|port| SwoTransport::Socket { port }),
        SwoSource::File => swo.swo_path.clone().map(|path| SwoTransport::File { path }),
        SwoSource::Serial => swo.swo_path.clone().map(|device| SwoTransport::Serial {
            device,
            baud_rate: swo.swo_frequency,
        }),
    }
}

/// Per-controller SWO state: the private capture path and the once-only latch
#[derive(Debug)]
pub struct SwoConfigurator {
    swo: SwoConfig,
    platform: Platform,
    // Keeps the private directory alive for the life of the controller
    _dir: Option<TempDir>,
    private_path: Option<String>,
    announced: bool,
}

impl SwoConfigurator {
    /// The private directory is only created when the probe itself captures trace
    pub fn new(swo: SwoConfig, platform: Platform) -> Result<Self> {
        let (dir, private_path) = if swo.enabled && swo.source == SwoSource::Probe {
            let dir = tempfile::Builder::new().prefix("openocd-swo-").tempdir()?;
            let mut path = dir.path().join("swo").to_string_lossy().into_owned();
            if platform == Platform::Windows {
                path = path.replace('\\', "/");
            }
            (Some(dir), Some(path))
        } else {
            (None, None)
        };

        Ok(Self {
            swo,
            platform,
            _dir: dir,
            private_path,
            announced: false,
        })
    }

    /// Path OpenOCD is told to write probe-captured trace to
    pub fn private_path(&self) -> Option<&str> {
        self.private_path.as_deref()
    }

    pub fn transport(&self) -> Option<SwoTransport> {
        // Only the probe source reads the private path, and it always has one
        let private_path = self.private_path.as_deref().unwrap_or_default();
        select_transport(&self.swo, self.platform, private_path)
    }

    pub fn has_announced(&self) -> bool {
        self.announced
    }

    /// Server process started. Creates the fifo and announces it when that is the transport.
    pub fn server_launch_started(&mut self) -> Option<SwoTransport> {
        let transport = self.transport().filter(SwoTransport::announced_at_launch_start)?;
        if let SwoTransport::Fifo { path } = &transport {
            create_fifo(Path::new(path));
        }
        self.announce(transport)
    }

    /// Server reported it finished launching. Announces every non-fifo transport.
    pub fn server_launch_completed(&mut self) -> Option<SwoTransport> {
        let transport = self.transport().filter(|t| !t.announced_at_launch_start())?;
        self.announce(transport)
    }

    fn announce(&mut self, transport: SwoTransport) -> Option<SwoTransport> {
        if self.announced {
            warn!("SWO transport already announced, ignoring {:?}", transport);
            return None;
        }
        self.announced = true;
        info!("SWO transport: {:?}", transport);
        Some(transport)
    }
}

fn create_fifo(path: &Path) {
    match std::process::Command::new("mkfifo").arg(path).status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("mkfifo {} exited with {}", path.display(), status),
        Err(e) => warn!("Failed to run mkfifo for {}: {}", path.display(), e),
    }
}
