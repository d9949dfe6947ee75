//! Error types for the external OpenOCD controller

use thiserror::Error;

/// Main error type for the controller
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("OpenOCD tcl socket already closed")]
    ChannelClosed,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid TOML syntax: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl ControllerError {
    /// True for failures that leave the TCL channel unusable
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            ControllerError::ChannelClosed
                | ControllerError::ConnectionFailed(_)
                | ControllerError::Transport(_)
        )
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ControllerError>;
