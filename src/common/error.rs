//! Error types for the test orchestrator
//!
//! Errors are split along how far they are allowed to travel: channel and
//! process failures end the run, while notification and single-asset
//! failures are absorbed by the caller and only logged.

use std::io;
use thiserror::Error;

use crate::runner::assets::AssetDescriptor;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // === Channel Errors ===
    #[error("Failed to read from {channel} channel: {message}")]
    ChannelRead { channel: String, message: String },

    #[error("Failed to write to {channel} channel: {message}")]
    ChannelWrite { channel: String, message: String },

    #[error("Channel {0} is closed")]
    ChannelClosed(String),

    // === Process Errors ===
    #[error("Failed to start {role}: {message}")]
    ProcessStart { role: String, message: String },

    #[error("No program configured for {0}. Add it to the [processes] section of the config file")]
    ProcessNotConfigured(String),

    // === Backend Errors ===
    #[error("Unknown backend '{name}'. Known backends: {known}")]
    UnknownBackend { name: String, known: String },

    #[error("Backend call '{command}' failed: {message}")]
    BackendCall { command: String, message: String },

    #[error("Backend call '{0}' timed out")]
    BackendTimeout(String),

    #[error("Unable to extract asset {asset}: {cause}")]
    AssetExtraction {
        asset: Box<AssetDescriptor>,
        cause: String,
    },

    #[error("Unable to handle generated assets: machine not shut down when uploading disks")]
    UnsafeShutdown,

    // === Notification Errors ===
    #[error("Unable to inform websocket clients: {0}")]
    Notification(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a channel read error
    pub fn channel_read(channel: &str, message: impl ToString) -> Self {
        Self::ChannelRead {
            channel: channel.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a channel write error
    pub fn channel_write(channel: &str, message: impl ToString) -> Self {
        Self::ChannelWrite {
            channel: channel.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a process start error
    pub fn process_start(role: impl ToString, message: impl ToString) -> Self {
        Self::ProcessStart {
            role: role.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a backend call error
    pub fn backend_call(command: &str, message: impl ToString) -> Self {
        Self::BackendCall {
            command: command.to_string(),
            message: message.to_string(),
        }
    }

    /// Create an asset extraction error
    pub fn asset_extraction(asset: &AssetDescriptor, cause: impl ToString) -> Self {
        Self::AssetExtraction {
            asset: Box::new(asset.clone()),
            cause: cause.to_string(),
        }
    }

    /// Whether the error means the peer is gone for good
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ChannelClosed(_) | Self::ChannelWrite { .. })
    }
}
