//! Error type shared by every adapter.

use std::path::PathBuf;
use thiserror::Error;

/// Failures an adapter invocation can surface to its caller.
///
/// Nothing is retried internally. Stdout that the scrapers do not recognise is
/// never an error; it only yields fewer output paths.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Invalid input record, detected before anything is launched.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The wrapped tool could not be launched or exited with a non-zero status.
    #[error("Execution of `{command}` failed (exit code {code:?}): {message}")]
    Execution {
        command: String,
        code: Option<i32>,
        message: String,
    },

    /// A declared output is missing after the run.
    #[error("Output `{slot}` not found: {}", path.display())]
    OutputNotFound { slot: String, path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    pub fn config(msg: impl Into<String>) -> Self {
        AdapterError::Configuration(msg.into())
    }
}

/// Result type alias using AdapterError
pub type Result<T> = std::result::Result<T, AdapterError>;
