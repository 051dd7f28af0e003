//! Error types for the monitoring subsystem.

use crate::metric::MetricKind;
use thiserror::Error;

/// Errors that can occur during metric registration or exposition.
#[derive(Debug, Error)]
pub enum MonitoringError {
    /// A metric name was re-registered with a different kind.
    #[error("metric {name} already registered as {existing:?}")]
    KindMismatch {
        /// Name of the conflicting metric family.
        name: String,
        /// Kind the family was originally registered with.
        existing: MetricKind,
    },

    /// A metric name contains characters outside the Prometheus charset.
    #[error("invalid metric name: {name}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// A label key contains characters outside the Prometheus charset.
    #[error("invalid label key: {key}")]
    InvalidLabelKey {
        /// The rejected label key.
        key: String,
    },

    /// The exposer was started while already running.
    #[error("exposer already running")]
    AlreadyRunning,

    /// I/O error from the standard library.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for monitoring operations.
pub type Result<T> = std::result::Result<T, MonitoringError>;
