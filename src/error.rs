//! Custom error types for the application.
//!
//! This module defines the primary error type, `L2Error`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while reading a record stream, writing chunk and burst
//! files, loading configuration, and checkpointing the burst buffer.
//!
//! ## Error Hierarchy
//!
//! `L2Error` is an enum that consolidates various error sources:
//!
//! - **`Io`**: Wraps standard `std::io::Error`, covering file I/O on the hot path.
//! - **`Settings`**: Wraps `figment::Error` raised while merging the TOML settings file
//!   and environment overrides.
//! - **`Config`**, **`MissingConfigKey`**, **`DuplicateConfigKey`**: Semantic problems in the
//!   whitespace-delimited filter configuration file.
//! - **`OpenInput`**, **`OpenOutput`**, **`OutputExists`**, **`OutputNotWritable`**: The
//!   resource-fatal class. These indicate a misconfiguration that online processing
//!   cannot route around.
//! - **`TruncatedRecord`**: The input stream ended in the middle of a bank.
//! - **`OversizedBank`**: A bank header declared a length no real bank can have.
//! - **`Checkpoint`**: A burst-buffer snapshot could not be parsed.
//!
//! Anomalies in the data itself (clock glitches, buffer overflow, unknown banks) are
//! never errors: they are alerted and handled locally by the component that sees them.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, L2Error>;

/// Primary error type for the record processor.
#[derive(Error, Debug)]
pub enum L2Error {
    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Run settings could not be extracted from defaults, file and environment.
    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    /// Run settings parsed but are logically inconsistent.
    #[error("Settings validation error: {0}")]
    InvalidSettings(String),

    /// A line of the filter configuration file could not be understood.
    #[error("Configuration error on line {line}: {message}")]
    Config {
        /// 1-based line number in the configuration file.
        line: usize,
        /// What was wrong with it.
        message: String,
    },

    /// A required filter configuration key was never supplied.
    #[error("Configuration file did not set parameter '{0}'")]
    MissingConfigKey(&'static str),

    /// A filter configuration key was supplied more than once.
    #[error("Configuration file set parameter '{0}' twice")]
    DuplicateConfigKey(String),

    /// The input stream could not be opened.
    #[error("Could not open input {path}: {source}")]
    OpenInput {
        /// Input path.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// An output stream could not be created.
    #[error("Could not open output {path}: {source}")]
    OpenOutput {
        /// Output path.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The output already exists and overwriting was disabled.
    #[error("{0} already exists and overwriting is disabled")]
    OutputExists(PathBuf),

    /// The output already exists and cannot be replaced.
    #[error("{0} already exists and cannot be overwritten")]
    OutputNotWritable(PathBuf),

    /// The input ended part-way through a bank.
    #[error("Truncated record at byte offset {offset}")]
    TruncatedRecord {
        /// Offset of the start of the incomplete bank.
        offset: u64,
    },

    /// A bank header declared a payload longer than any bank the detector produces.
    #[error("Bank at byte offset {offset} declares {len} bytes, limit is {limit}")]
    OversizedBank {
        /// Offset of the bank header.
        offset: u64,
        /// Declared payload length.
        len: usize,
        /// Largest accepted payload.
        limit: usize,
    },

    /// A burst buffer checkpoint is malformed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// JSON encoding of a job ticket or statistics sample failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for L2Error {
    fn from(value: figment::Error) -> Self {
        L2Error::Settings(Box::new(value))
    }
}

impl L2Error {
    /// Whether this error belongs to the resource-fatal class that aborts the run.
    ///
    /// Everything that prevents the process from reading its input, writing its
    /// outputs or knowing its configuration is fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            L2Error::Settings(_)
            | L2Error::InvalidSettings(_)
            | L2Error::Config { .. }
            | L2Error::MissingConfigKey(_)
            | L2Error::DuplicateConfigKey(_)
            | L2Error::OpenInput { .. }
            | L2Error::OpenOutput { .. }
            | L2Error::OutputExists(_)
            | L2Error::OutputNotWritable(_) => true,
            L2Error::Io(_)
            | L2Error::TruncatedRecord { .. }
            | L2Error::OversizedBank { .. }
            | L2Error::Checkpoint(_)
            | L2Error::Json(_) => false,
        }
    }
}
