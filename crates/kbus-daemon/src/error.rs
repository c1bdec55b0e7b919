//! Daemon error types.

use kbus_core::{BusError, ConfigError};
use thiserror::Error;

/// Errors raised by the daemon outside a single bus operation.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A bus operation failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// No bus with this name is hosted.
    #[error("bus '{name}' not found")]
    UnknownBus {
        /// The requested bus.
        name: String,
    },

    /// A bus with this name is already hosted.
    #[error("bus '{name}' already exists")]
    BusExists {
        /// The duplicate name.
        name: String,
    },

    /// A control frame could not be decoded or encoded.
    #[error("invalid control frame: {0}")]
    Frame(#[from] serde_json::Error),
}

/// Result alias for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
