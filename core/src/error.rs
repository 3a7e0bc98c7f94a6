//! Error taxonomy for the filtering core.
//!
//! Configuration problems are raised eagerly when a model or config is built. Numerical
//! problems surface when a covariance reaching a Cholesky decomposition is not positive
//! definite. Any error inside a filtering or forecast step aborts the whole sequence: a single
//! corrupted timestep invalidates the importance-weight chain, so there is no partial recovery.

use thiserror::Error;

/// Errors produced by the RBPF core.
#[derive(Error, Debug)]
pub enum RbpfError {
    /// Invalid configuration, malformed dimensions, or mismatched particle counts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A covariance could not be factorized.
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// The requested operation is not provided by this model family.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// I/O error while reading or writing a configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialization error for a configuration file.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RbpfError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        RbpfError::Configuration(msg.into())
    }

    pub(crate) fn numerical(msg: impl Into<String>) -> Self {
        RbpfError::Numerical(msg.into())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RbpfError>;
