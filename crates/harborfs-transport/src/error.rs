//! Error types for the transport subsystem.

use thiserror::Error;

/// Errors surfaced by transport setup and the acceptor.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The acceptor was started while already running.
    #[error("acceptor already running")]
    AlreadyRunning,

    /// Configuration could not be parsed.
    #[error("invalid configuration: {msg}")]
    InvalidConfig {
        /// Parser-provided description.
        msg: String,
    },

    /// Metric registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] harborfs_monitoring::MonitoringError),

    /// I/O error from the standard library.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
