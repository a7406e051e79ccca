//! Diagnostics error types
//!
//! Only configuration and lookup failures are errors here. Per-file parse
//! failures, empty symbol lookups and failed sandbox runs are ordinary values
//! (`ScanStats::parse_errors`, `Lookup::Missing`, `ExecutionResult`).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for diagnostics operations
pub type DiagnosticsResult<T> = Result<T, DiagnosticsError>;

/// Errors that can occur while building or querying a project index
#[derive(Error, Debug)]
pub enum DiagnosticsError {
    /// Project root does not exist or is not a directory
    #[error("Invalid project root: {path} ({reason})")]
    InvalidProjectRoot { path: PathBuf, reason: String },

    /// The requested file was never indexed (outside root, ignored, or absent)
    #[error("File not found in project index: {file}")]
    FileNotIndexed { file: String },

    /// IO error with the path that caused it
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration values out of range
    #[error("Configuration error: {message}")]
    InvalidConfig { message: String },
}

impl DiagnosticsError {
    /// Create an invalid project root error
    pub fn invalid_root(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidProjectRoot {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a file-not-indexed error
    pub fn not_indexed(file: impl Into<String>) -> Self {
        Self::FileNotIndexed { file: file.into() }
    }

    /// Wrap an IO error with its path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether the caller supplied bad input (as opposed to an environment failure)
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidProjectRoot { .. } | Self::InvalidConfig { .. }
        )
    }
}
