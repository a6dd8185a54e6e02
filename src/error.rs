//! Error handling module for the install engine
//!
//! Provides centralized error handling with proper error types using thiserror.
//! All fallible engine operations return these types for consistency. The
//! binary wraps them in `anyhow` at the top level; the library never panics
//! on a fallible path.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the install engine
#[derive(Error, Debug)]
pub enum InstallError {
    /// IO errors (config files, log files, target filesystem)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An external command exited non-zero or could not be spawned
    #[error("command `{program}` failed with exit code {code}: {stderr}")]
    Command {
        program: String,
        code: i32,
        stderr: String,
    },

    /// A curtin install step failed
    #[error("install step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<InstallError>,
    },

    /// A device-map file configured for a step was missing or unparseable
    #[error("device map {} unusable: {reason}", .path.display())]
    DeviceMap { path: PathBuf, reason: String },

    /// Filesystem model errors (encryption setup, finalize hooks)
    #[error("filesystem model error: {0}")]
    Model(String),

    /// Apt/mirror subsystem errors
    #[error("apt configuration error: {0}")]
    Apt(String),

    /// The install flow was abandoned: a controlling channel closed
    /// before the engine received the signal it was suspended on
    #[error("install flow interrupted: {0}")]
    FlowInterrupted(String),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, InstallError>;

// Convenient error constructors
impl InstallError {
    /// Create a command-failure error
    pub fn command(program: impl Into<String>, code: i32, stderr: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            code,
            stderr: stderr.into(),
        }
    }

    /// Wrap an error as a named step failure
    pub fn step(step: impl Into<String>, source: InstallError) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Create a device-map error
    pub fn device_map(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DeviceMap {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a filesystem model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create an apt configuration error
    pub fn apt(msg: impl Into<String>) -> Self {
        Self::Apt(msg.into())
    }

    /// Create a flow-interruption error
    pub fn flow_interrupted(msg: impl Into<String>) -> Self {
        Self::FlowInterrupted(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InstallError::command("curtin", 3, "block-meta failed");
        assert_eq!(
            err.to_string(),
            "command `curtin` failed with exit code 3: block-meta failed"
        );

        let err = InstallError::model("no TPM available");
        assert_eq!(err.to_string(), "filesystem model error: no TPM available");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: InstallError = io_err.into();
        assert!(matches!(err, InstallError::Io(_)));
    }

    #[test]
    fn test_step_error_wraps_source() {
        let inner = InstallError::command("curtin", 1, "");
        let err = InstallError::step("partitioning", inner);
        let msg = err.to_string();
        assert!(msg.contains("install step 'partitioning' failed"));
        assert!(matches!(err, InstallError::Step { .. }));
    }
}
