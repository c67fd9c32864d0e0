//! Structured error types for chatlog-core.
//!
//! These cover the collaborators around the extraction core (input loading,
//! output writing, configuration). A single malformed conversation is never a
//! `ChatlogError`; it surfaces as an [`ExtractionFailure`](crate::ExtractionFailure)
//! so the batch keeps going.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for chatlog-core operations
#[derive(Error, Debug)]
pub enum ChatlogError {
    /// I/O operation failed
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// JSON parsing or serialization failed
    #[error("JSON error at {context}: {source}")]
    Json {
        context: String,
        source: serde_json::Error,
    },

    /// YAML front matter serialization failed
    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },

    /// Input is not a JSON array or NDJSON stream of conversations
    #[error("Invalid input {path:?}: {reason}")]
    InvalidInput { path: PathBuf, reason: String },

    /// Empty input file (cannot detect format)
    #[error("Empty input file: {path:?}")]
    EmptyFile { path: PathBuf },

    /// Writing an output artifact failed
    #[error("Failed to write {path:?}: {source}")]
    Output { path: PathBuf, source: io::Error },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Worker pool for parallel extraction could not be started
    #[error("Failed to build thread pool: {source}")]
    ThreadPool {
        #[from]
        source: rayon::ThreadPoolBuildError,
    },
}

/// Result type alias for chatlog-core operations
pub type Result<T> = std::result::Result<T, ChatlogError>;

impl ChatlogError {
    /// Create a JSON error with context
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an empty file error
    pub fn empty_file(path: impl Into<PathBuf>) -> Self {
        Self::EmptyFile { path: path.into() }
    }

    /// Create an output error for the given path
    pub fn output(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Output {
            path: path.into(),
            source,
        }
    }

    /// Create a config error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChatlogError::invalid_input("/tmp/conversations.json", "expected '['");
        assert!(err.to_string().contains("Invalid input"));
        assert!(err.to_string().contains("/tmp/conversations.json"));

        let err = ChatlogError::config("unknown format 'pdf'");
        assert_eq!(err.to_string(), "Configuration error: unknown format 'pdf'");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ChatlogError = io_err.into();

        assert!(matches!(err, ChatlogError::Io { .. }));
    }

    #[test]
    fn test_output_error_names_path() {
        let err = ChatlogError::output(
            "/out/md/Title.md",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/out/md/Title.md"));
    }
}
