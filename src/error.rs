//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, used by the sweep
//! engine, the result processor and the measurement worker. Built on
//! `thiserror`, it gives every failure mode of a characterization run one
//! place to live, from instrument discovery to report export.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: one or more instrument ports failed discovery. The sweep
//!   never starts.
//! - **`MeasurementCancelled`**: the cancellation checkpoint observed a set
//!   token. Always preceded by the instrument shutdown sequence and surfaced as
//!   an expected, non-fatal termination.
//! - **`Instrument`** / **`InvalidReply`**: a `send`/`query` failed or returned
//!   something that is not a number. Fatal to the current sweep, no retry.
//! - **`InvalidParams`**: sweep parameters that cannot produce a sweep.
//! - **`Config`**, **`Io`**, **`Json`**, **`TomlDe`**, **`TomlSer`**, **`Csv`**:
//!   wrapped errors from configuration and file handling.
//!
//! Missing adjustment positions and a missing expected-value table are not
//! errors and have no variant here.

use crate::instrument::Role;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Errors raised across the crate.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or extracted
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Sweep parameters or a setting out of range
    #[error("Invalid sweep parameters: {0}")]
    InvalidParams(String),

    /// Roles that did not answer discovery
    #[error("Instruments not found: {}", .0.join(", "))]
    Connection(Vec<String>),

    /// A task was started before discovery succeeded
    #[error("Instruments are not connected")]
    NotConnected,

    /// The sweep stopped at a checkpoint after the safe shutdown
    #[error("Measurement cancelled")]
    MeasurementCancelled,

    /// An instrument command failed
    #[error("Instrument error ({role}): {message}")]
    Instrument {
        /// Role of the failing port
        role: Role,
        /// Port error text
        message: String,
    },

    /// A query reply did not parse as a number
    #[error("Unexpected reply from {role} to '{command}': {reply:?}")]
    InvalidReply {
        /// Role that replied
        role: Role,
        /// Query that was sent
        command: String,
        /// Raw reply text
        reply: String,
    },

    /// No device profile with that name
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    /// A task is still running
    #[error("A measurement task is already running")]
    WorkerBusy,

    /// The global subscriber could not be installed
    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// File I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML write
    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// CSV read or write
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl DaqError {
    /// Wrap a port-level failure, keeping the whole `anyhow` context chain.
    pub fn instrument(role: Role, err: anyhow::Error) -> Self {
        DaqError::Instrument {
            role,
            message: format!("{err:#}"),
        }
    }

    /// True for the expected cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DaqError::MeasurementCancelled)
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
