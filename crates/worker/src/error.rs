//! Worker error types.

use messaging::ChannelError;
use thiserror::Error;

/// Errors that stop the worker from starting or running.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// An environment variable holds a value that cannot be used.
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidConfig {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// The broker rejected the topology or went away.
    #[error("Message channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The Prometheus recorder could not be installed.
    #[error("Metrics recorder error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    /// Binding or serving the ops listener failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
